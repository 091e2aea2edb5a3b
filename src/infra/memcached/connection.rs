//! A single memcached endpoint, driven through the `memcache` client.
//!
//! The client is blocking, so every call runs on the blocking pool and is
//! bounded by the configured timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use memcache::{Client, MemcacheError};
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::warn;
use url::Url;

use crate::cache::store::StoreError;

use super::endpoint::Endpoint;

const MAX_KEY_LEN: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Text,
    Binary,
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub protocol: Protocol,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub credentials: Option<Credentials>,
}

pub struct Connection {
    client: Arc<Client>,
    io_timeout: Duration,
}

impl Connection {
    /// Connect and, for the binary protocol with credentials, authenticate.
    pub async fn open(endpoint: &Endpoint, options: &ConnectOptions) -> Result<Self, StoreError> {
        if options.credentials.is_some() && options.protocol == Protocol::Text {
            warn!(
                endpoint = %endpoint,
                "SASL credentials require the binary protocol; connecting unauthenticated"
            );
        }
        let url = client_url(endpoint, options)?;
        let client = run(options.connect_timeout, move || Client::connect(url.to_string())).await?;
        Ok(Self {
            client: Arc::new(client),
            io_timeout: options.io_timeout,
        })
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Bytes>, StoreError> {
        validate_key(key)?;
        let client = Arc::clone(&self.client);
        let key = key.to_string();
        let value = run(self.io_timeout, move || client.get::<Vec<u8>>(&key)).await?;
        Ok(value.map(Bytes::from))
    }

    pub async fn set(&mut self, key: &str, value: &[u8], exptime: u32) -> Result<(), StoreError> {
        validate_key(key)?;
        let client = Arc::clone(&self.client);
        let key = key.to_string();
        let value = value.to_vec();
        run(self.io_timeout, move || client.set(&key, value.as_slice(), exptime)).await
    }

    pub async fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let client = Arc::clone(&self.client);
        let key = key.to_string();
        run(self.io_timeout, move || client.delete(&key)).await
    }

    pub async fn flush_all(&mut self) -> Result<(), StoreError> {
        let client = Arc::clone(&self.client);
        run(self.io_timeout, move || client.flush()).await
    }
}

/// Connection URL understood by the client: `memcache://host:port` or
/// `memcache:///socket/path`, with the protocol, read timeout and credentials
/// carried along.
pub(crate) fn client_url(endpoint: &Endpoint, options: &ConnectOptions) -> Result<Url, StoreError> {
    let base = match endpoint {
        Endpoint::Tcp { .. } => format!("memcache://{endpoint}"),
        Endpoint::Unix(path) => format!("memcache://{}", path.display()),
    };
    let mut url = Url::parse(&base)
        .map_err(|err| StoreError::Protocol(format!("invalid endpoint `{endpoint}`: {err}")))?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("timeout", &options.io_timeout.as_secs_f64().to_string());
        if options.protocol == Protocol::Text {
            query.append_pair("protocol", "ascii");
        }
    }

    if let (Protocol::Binary, Some(credentials)) = (options.protocol, &options.credentials) {
        url.set_username(&credentials.username)
            .and_then(|()| url.set_password(Some(&credentials.password)))
            .map_err(|()| {
                StoreError::Auth(format!("endpoint `{endpoint}` cannot carry credentials"))
            })?;
    }
    Ok(url)
}

/// Run a blocking client call off the runtime, bounded by `limit`.
async fn run<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, MemcacheError> + Send + 'static,
{
    let joined = timeout(limit, spawn_blocking(call))
        .await
        .map_err(|_| StoreError::Timeout(limit))?;
    let result = joined.map_err(|err| StoreError::Server(format!("client task failed: {err}")))?;
    result.map_err(classify)
}

/// Any client-side failure leaves the connection in an unknown state.
fn classify(err: MemcacheError) -> StoreError {
    StoreError::Protocol(err.to_string())
}

pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("empty key".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_LEN}; enable key hashing",
            key.len()
        )));
    }
    if key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(StoreError::InvalidKey(format!("key contains whitespace: `{key}`")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn options(protocol: Protocol, credentials: Option<Credentials>) -> ConnectOptions {
        ConnectOptions {
            protocol,
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_millis(500),
            credentials,
        }
    }

    fn shop_credentials() -> Credentials {
        Credentials {
            username: "shop".into(),
            password: "p@ss word".into(),
        }
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("data-http://shop.example/").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key(&"k".repeat(251)).is_err());
        assert!(validate_key(&"k".repeat(250)).is_ok());
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let rendered = format!("{:?}", shop_credentials());
        assert!(rendered.contains("shop"));
        assert!(!rendered.contains("p@ss"));
    }

    #[test]
    fn text_protocol_url_selects_ascii() {
        let endpoint = Endpoint::Tcp {
            host: "cache1".into(),
            port: 11311,
        };
        let url = client_url(&endpoint, &options(Protocol::Text, Some(shop_credentials())))
            .expect("url");
        assert_eq!(url.host_str(), Some("cache1"));
        assert_eq!(url.port(), Some(11311));
        assert_eq!(url.username(), "");
        let pairs: Vec<_> = url.query_pairs().collect();
        assert!(pairs.iter().any(|(k, v)| k == "protocol" && v == "ascii"));
        assert!(pairs.iter().any(|(k, v)| k == "timeout" && v == "0.5"));
    }

    #[test]
    fn binary_protocol_url_carries_encoded_credentials() {
        let endpoint = Endpoint::Tcp {
            host: "cache1".into(),
            port: 11211,
        };
        let url = client_url(&endpoint, &options(Protocol::Binary, Some(shop_credentials())))
            .expect("url");
        assert_eq!(url.username(), "shop");
        assert_eq!(url.password(), Some("p%40ss%20word"));
        assert!(!url.query_pairs().any(|(k, _)| k == "protocol"));
    }

    #[test]
    fn unix_socket_url_keeps_the_path() {
        let endpoint = Endpoint::Unix(PathBuf::from("/var/run/memcached.sock"));
        let url = client_url(&endpoint, &options(Protocol::Text, None)).expect("url");
        assert_eq!(url.path(), "/var/run/memcached.sock");
        assert!(url.as_str().starts_with("memcache:///var/run/memcached.sock?"));
    }

    #[tokio::test]
    async fn refused_connection_is_fatal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let err = Connection::open(&endpoint, &options(Protocol::Text, None))
            .await
            .err()
            .expect("refused");
        assert!(err.is_fatal());
    }
}
