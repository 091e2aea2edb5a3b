//! Cache key construction.
//!
//! A page is stored under two keys sharing one substituted template: the
//! `data` key holds the body, the `meta` key holds the [`MetaRecord`].
//!
//! [`MetaRecord`]: super::entry::MetaRecord

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use super::config::CacheConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("`{0}` is not an absolute URL with a host")]
    InvalidPermalink(String),
}

/// The logical resource a key is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    pub scheme: String,
    /// Host, including a non-default port.
    pub host: String,
    /// Request path (and query when one is present).
    pub path: String,
    /// Authenticated user name; empty for anonymous viewers.
    pub user: String,
    /// Session cookie value; empty when absent.
    pub session: String,
}

impl ResourceIdentity {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let path = path.into();
        Self {
            scheme: scheme.into(),
            host: host.into(),
            path: if path.is_empty() { "/".to_string() } else { path },
            user: String::new(),
            session: String::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// Parse an absolute permalink such as `https://shop.example/hello/`.
    pub fn from_permalink(permalink: &str) -> Result<Self, KeyError> {
        let url =
            Url::parse(permalink).map_err(|_| KeyError::InvalidPermalink(permalink.to_string()))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| KeyError::InvalidPermalink(permalink.to_string()))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self::new(url.scheme(), host, url.path()))
    }

    pub fn permalink(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }

    /// The feed endpoint hanging off this resource.
    pub fn feed_variant(&self) -> Self {
        let mut path = self.path.clone();
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str("feed/");
        Self { path, ..self.clone() }
    }

    /// Sub-page `page` of a paginated resource.
    pub fn paged(&self, page: usize) -> Self {
        let mut path = self.path.clone();
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(&format!("{page}/"));
        Self { path, ..self.clone() }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.permalink())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Data,
    Meta,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Data => "data",
            EntryKind::Meta => "meta",
        }
    }
}

/// A fully built backend key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds keys from a host's template, prefixes and hashing flag.
#[derive(Debug, Clone, Copy)]
pub struct KeyBuilder<'a> {
    template: &'a str,
    prefix_data: &'a str,
    prefix_meta: &'a str,
    hash: bool,
}

impl<'a> KeyBuilder<'a> {
    pub fn new(config: &'a CacheConfig) -> Self {
        Self {
            template: &config.key_template,
            prefix_data: &config.prefix_data,
            prefix_meta: &config.prefix_meta,
            hash: config.hash_keys,
        }
    }

    pub fn build_key(&self, identity: &ResourceIdentity, kind: EntryKind) -> CacheKey {
        let substituted = substitute(self.template, identity);
        let body = if self.hash {
            let mut hasher = Sha256::new();
            hasher.update(substituted.as_bytes());
            hex::encode(hasher.finalize())
        } else {
            substituted
        };
        let prefix = match kind {
            EntryKind::Data => self.prefix_data,
            EntryKind::Meta => self.prefix_meta,
        };
        CacheKey(format!("{prefix}{body}"))
    }

    /// `(data, meta)` for one identity.
    pub fn build_pair(&self, identity: &ResourceIdentity) -> (CacheKey, CacheKey) {
        (
            self.build_key(identity, EntryKind::Data),
            self.build_key(identity, EntryKind::Meta),
        )
    }

    /// Data and meta keys for every identity, in input order.
    pub fn build_keys<'i, I>(&self, identities: I) -> Vec<CacheKey>
    where
        I: IntoIterator<Item = &'i ResourceIdentity>,
    {
        identities
            .into_iter()
            .flat_map(|identity| {
                let (data, meta) = self.build_pair(identity);
                [data, meta]
            })
            .collect()
    }
}

fn substitute(template: &str, identity: &ResourceIdentity) -> String {
    let mut out = String::with_capacity(template.len() + identity.path.len() + identity.host.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..name_len];
        match placeholder(name, identity) {
            Some(value) => out.push_str(value),
            None => {
                out.push('$');
                out.push_str(name);
            }
        }
        rest = &after[name_len..];
    }
    out.push_str(rest);
    out
}

fn placeholder<'i>(name: &str, identity: &'i ResourceIdentity) -> Option<&'i str> {
    match name {
        "scheme" => Some(&identity.scheme),
        "host" => Some(&identity.host),
        "request_uri" => Some(&identity.path),
        "remote_user" => Some(&identity.user),
        "session_id" => Some(&identity.session),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ResourceIdentity {
        ResourceIdentity::new("https", "shop.example", "/hello/")
    }

    #[test]
    fn default_template_produces_prefixed_url() {
        let config = CacheConfig::default();
        let builder = KeyBuilder::new(&config);
        let (data, meta) = builder.build_pair(&identity());
        assert_eq!(data.as_str(), "data-https://shop.example/hello/");
        assert_eq!(meta.as_str(), "meta-https://shop.example/hello/");
    }

    #[test]
    fn same_identity_builds_same_key() {
        let config = CacheConfig {
            hash_keys: true,
            ..Default::default()
        };
        let builder = KeyBuilder::new(&config);
        let first = builder.build_key(&identity(), EntryKind::Data);
        let second = builder.build_key(&identity(), EntryKind::Data);
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), "data-".len() + 64);
        assert!(first.as_str().starts_with("data-"));
    }

    #[test]
    fn user_and_session_placeholders() {
        let config = CacheConfig {
            key_template: "$host$request_uri#$remote_user#$session_id".to_string(),
            ..Default::default()
        };
        let builder = KeyBuilder::new(&config);
        let anon = builder.build_key(&identity(), EntryKind::Meta);
        assert_eq!(anon.as_str(), "meta-shop.example/hello/##");

        let named = identity().with_user("ada").with_session("s1");
        let key = builder.build_key(&named, EntryKind::Meta);
        assert_eq!(key.as_str(), "meta-shop.example/hello/#ada#s1");
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let config = CacheConfig {
            key_template: "$scheme-$cookie_x-$".to_string(),
            ..Default::default()
        };
        let key = KeyBuilder::new(&config).build_key(&identity(), EntryKind::Data);
        assert_eq!(key.as_str(), "data-https-$cookie_x-$");
    }

    #[test]
    fn build_keys_pairs_every_identity() {
        let config = CacheConfig::default();
        let ids = [identity(), identity().feed_variant()];
        let keys = KeyBuilder::new(&config).build_keys(&ids);
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[3].as_str(), "meta-https://shop.example/hello/feed/");
    }

    #[test]
    fn permalink_parsing_keeps_port() {
        let id = ResourceIdentity::from_permalink("http://shop.example:8080/a/b/").expect("valid");
        assert_eq!(id.host, "shop.example:8080");
        assert_eq!(id.path, "/a/b/");
        assert_eq!(id.permalink(), "http://shop.example:8080/a/b/");
    }

    #[test]
    fn permalink_without_host_is_rejected() {
        assert!(ResourceIdentity::from_permalink("/relative/").is_err());
        assert!(ResourceIdentity::from_permalink("mailto:ada@example.com").is_err());
    }

    #[test]
    fn paged_and_feed_variants_append_segments() {
        let id = ResourceIdentity::new("https", "shop.example", "/guide");
        assert_eq!(id.paged(2).path, "/guide/2/");
        assert_eq!(id.feed_variant().path, "/guide/feed/");
        assert_eq!(identity().paged(1).path, "/hello/1/");
    }
}
