//! Memcached backend.
//!
//! One reusable client per endpoint, each behind an async mutex. Keys are
//! placed by a stable hash so every front-end agrees on which endpoint holds
//! them. An endpoint that fails is marked dead and re-probed lazily once
//! `reconnect_interval` has passed.

mod connection;
mod endpoint;

use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::lock::lock_recovering;
use crate::cache::store::{Backend, StoreError};

pub use connection::{ConnectOptions, Connection, Credentials, Protocol};
pub use endpoint::{DEFAULT_PORT, Endpoint, parse_server_list};

const SOURCE: &str = "infra::memcached";
const PROBE_KEY: &str = "pagegate-probe";
/// Expirations above this many seconds are read by memcached as Unix timestamps.
const RELATIVE_EXPTIME_LIMIT: u32 = 60 * 60 * 24 * 30;

struct Node {
    endpoint: Endpoint,
    conn: Mutex<Option<Connection>>,
    alive: AtomicBool,
    last_failure: StdMutex<Option<Instant>>,
}

impl Node {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            conn: Mutex::new(None),
            alive: AtomicBool::new(false),
            last_failure: StdMutex::new(None),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn retry_due(&self, interval: Duration) -> bool {
        lock_recovering(&self.last_failure, SOURCE, "retry_due")
            .is_none_or(|failed_at| failed_at.elapsed() >= interval)
    }

    fn mark_alive(&self) {
        if !self.alive.swap(true, Ordering::SeqCst) {
            info!(endpoint = %self.endpoint, "Memcached endpoint is up");
        }
        *lock_recovering(&self.last_failure, SOURCE, "mark_alive") = None;
    }

    fn mark_dead(&self, err: &StoreError) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!(endpoint = %self.endpoint, error = %err, "Memcached endpoint marked dead");
        }
        *lock_recovering(&self.last_failure, SOURCE, "mark_dead") = Some(Instant::now());
    }
}

pub struct MemcachedPool {
    nodes: Vec<Node>,
    options: ConnectOptions,
    reconnect_interval: Duration,
}

impl MemcachedPool {
    /// Build the pool and verify every endpoint with a write/read round trip.
    ///
    /// Never fails: unreachable endpoints start out dead, and an empty list
    /// yields a pool that is never alive.
    pub async fn connect(
        endpoints: Vec<Endpoint>,
        options: ConnectOptions,
        reconnect_interval: Duration,
    ) -> Self {
        if endpoints.is_empty() {
            warn!("No memcached servers configured; page cache is disabled");
        }
        let pool = Self {
            nodes: endpoints.into_iter().map(Node::new).collect(),
            options,
            reconnect_interval,
        };

        for node in &pool.nodes {
            match pool.register(node).await {
                Ok(()) => {}
                Err(err) => {
                    node.mark_dead(&err);
                    warn!(
                        endpoint = %node.endpoint,
                        error = %err,
                        "Memcached endpoint failed its probe"
                    );
                }
            }
        }
        pool
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.nodes.iter().map(|node| &node.endpoint)
    }

    async fn register(&self, node: &Node) -> Result<(), StoreError> {
        let connection = self.reopen(node).await?;
        *node.conn.lock().await = Some(connection);
        node.mark_alive();
        Ok(())
    }

    /// Open a connection that has passed the write/read round trip.
    async fn reopen(&self, node: &Node) -> Result<Connection, StoreError> {
        let mut connection = Connection::open(&node.endpoint, &self.options).await?;
        probe(&mut connection).await?;
        Ok(connection)
    }

    fn route(&self, key: &str) -> Result<&Node, StoreError> {
        if self.nodes.is_empty() {
            return Err(StoreError::NotAlive);
        }
        let index = slot(key, self.nodes.len());
        Ok(&self.nodes[index])
    }

    /// Lock the node's connection, reopening it when it was dropped.
    async fn checkout<'n>(
        &self,
        node: &'n Node,
    ) -> Result<MutexGuard<'n, Option<Connection>>, StoreError> {
        if !node.is_alive() && !node.retry_due(self.reconnect_interval) {
            return Err(StoreError::NotAlive);
        }
        let mut guard = node.conn.lock().await;
        if guard.is_none() {
            debug!(endpoint = %node.endpoint, "Reconnecting to memcached");
            match self.reopen(node).await {
                Ok(connection) => {
                    *guard = Some(connection);
                    node.mark_alive();
                }
                Err(err) => {
                    node.mark_dead(&err);
                    return Err(err);
                }
            }
        }
        Ok(guard)
    }

    fn settle<T>(node: &Node, guard: &mut Option<Connection>, result: &Result<T, StoreError>) {
        if let Err(err) = result
            && err.is_fatal()
        {
            *guard = None;
            node.mark_dead(err);
        }
    }
}

/// Stable endpoint index for a key.
fn slot(key: &str, len: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % len as u64) as usize
}

fn exptime(ttl: u32, now: i64) -> u32 {
    if ttl <= RELATIVE_EXPTIME_LIMIT {
        return ttl;
    }
    u32::try_from(now.saturating_add(i64::from(ttl))).unwrap_or(u32::MAX)
}

async fn probe(connection: &mut Connection) -> Result<(), StoreError> {
    connection.set(PROBE_KEY, b"1", 10).await?;
    match connection.get(PROBE_KEY).await? {
        Some(value) if value.as_ref() == b"1" => Ok(()),
        Some(_) => Err(StoreError::Protocol("probe read back a different value".to_string())),
        None => Err(StoreError::Protocol("probe value was not stored".to_string())),
    }
}

#[async_trait]
impl Backend for MemcachedPool {
    fn name(&self) -> &'static str {
        "memcached"
    }

    fn is_alive(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| node.is_alive() || node.retry_due(self.reconnect_interval))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let node = self.route(key)?;
        let mut guard = self.checkout(node).await?;
        let result = match guard.as_mut() {
            Some(connection) => connection.get(key).await,
            None => Err(StoreError::NotAlive),
        };
        Self::settle(node, &mut guard, &result);
        result
    }

    async fn set(&self, key: &str, value: Bytes, ttl: u32) -> Result<(), StoreError> {
        let node = self.route(key)?;
        let exptime = exptime(ttl, OffsetDateTime::now_utc().unix_timestamp());
        let mut guard = self.checkout(node).await?;
        let result = match guard.as_mut() {
            Some(connection) => connection.set(key, &value, exptime).await,
            None => Err(StoreError::NotAlive),
        };
        Self::settle(node, &mut guard, &result);
        result
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let node = self.route(key)?;
        let mut guard = self.checkout(node).await?;
        let result = match guard.as_mut() {
            Some(connection) => connection.delete(key).await,
            None => Err(StoreError::NotAlive),
        };
        Self::settle(node, &mut guard, &result);
        result
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let mut flushed = false;
        let mut last_error = None;
        for node in &self.nodes {
            let mut guard = match self.checkout(node).await {
                Ok(guard) => guard,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };
            let result = match guard.as_mut() {
                Some(connection) => connection.flush_all().await,
                None => Err(StoreError::NotAlive),
            };
            Self::settle(node, &mut guard, &result);
            match result {
                Ok(()) => flushed = true,
                Err(err) => last_error = Some(err),
            }
        }
        match (flushed, last_error) {
            (false, Some(err)) => Err(err),
            (false, None) => Err(StoreError::NotAlive),
            (true, _) => Ok(()),
        }
    }

    async fn status_probe(&self) -> BTreeMap<String, u8> {
        let checks = self.nodes.iter().map(|node| async move {
            let healthy = match Connection::open(&node.endpoint, &self.options).await {
                Ok(mut connection) => probe(&mut connection).await.is_ok(),
                Err(_) => false,
            };
            (node.endpoint.to_string(), u8::from(healthy))
        });
        join_all(checks).await.into_iter().collect()
    }
}
