//! Cache configuration snapshots.
//!
//! `CacheConfig` is the read-only, per-host view the gateway consults on every
//! request. `GatewayOptions` holds the settings shared by all hosts.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use super::entry::PageKind;

/// Default key template: scheme, host and request path.
pub const DEFAULT_KEY_TEMPLATE: &str = "$scheme://$host$request_uri";
pub const DEFAULT_PREFIX_DATA: &str = "data-";
pub const DEFAULT_PREFIX_META: &str = "meta-";
pub const DEFAULT_LOGGED_IN_COOKIE_PREFIX: &str = "storefront_logged_in";
pub const DEFAULT_SESSION_COOKIE: &str = "storefront_session";
pub const DEFAULT_NOCACHE_COOKIE: &str = "pagegate-nocache";
pub const WILDCARD_HOST: &str = "*";

const DEFAULT_EXPIRE_SECS: u64 = 300;
const DEFAULT_EXPIRE_HOME_SECS: u64 = 300;
const DEFAULT_EXPIRE_TAXONOMY_SECS: u64 = 300;
const DEFAULT_EXPIRE_SINGLE_SECS: u64 = 300;
const DEFAULT_NOCACHE_COOKIE_TTL_SECS: u64 = 86_400;
const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// How much of the keyspace a content mutation purges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationMode {
    /// Flush the whole backend.
    Flush,
    /// Only the mutated resource (and its sub-pages and feed).
    #[default]
    Resource,
    /// The resource plus every public taxonomy term listing.
    Taxonomies,
    /// The resource plus the posts index page.
    Index,
}

impl InvalidationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationMode::Flush => "flush",
            InvalidationMode::Resource => "resource",
            InvalidationMode::Taxonomies => "taxonomies",
            InvalidationMode::Index => "index",
        }
    }

    pub fn includes_taxonomies(&self) -> bool {
        matches!(self, InvalidationMode::Taxonomies)
    }

    pub fn includes_index(&self) -> bool {
        matches!(self, InvalidationMode::Index)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "flush" | "all" => Some(InvalidationMode::Flush),
            "resource" | "single" => Some(InvalidationMode::Resource),
            "taxonomies" | "taxonomy" => Some(InvalidationMode::Taxonomies),
            "index" => Some(InvalidationMode::Index),
            _ => None,
        }
    }
}

/// Per-host cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Template the resource identity is substituted into.
    pub key_template: String,
    /// Prefix for raw body entries.
    pub prefix_data: String,
    /// Prefix for metadata entries.
    pub prefix_meta: String,
    /// Hash the substituted template (SHA-256) before prefixing.
    pub hash_keys: bool,
    /// TTL in seconds for feeds and unclassified pages.
    pub expire: u64,
    /// TTL for the home page.
    pub expire_home: u64,
    /// TTL for archive and taxonomy listings.
    pub expire_taxonomy: u64,
    /// TTL for single content items.
    pub expire_single: u64,
    pub nocache_home: bool,
    pub nocache_feed: bool,
    pub nocache_archive: bool,
    pub nocache_single: bool,
    /// Cookie-name prefixes that disable caching when present.
    pub nocache_cookies: Vec<String>,
    /// Request paths matching this pattern are never cached.
    pub nocache_url: Option<Regex>,
    /// Serve and populate the cache for logged-in viewers too.
    pub cache_logged_in: bool,
    pub logged_in_cookie_prefix: String,
    /// Cookie whose value feeds the `$session_id` placeholder.
    pub session_cookie: String,
    pub invalidation_mode: InvalidationMode,
    /// Emit the `X-Cache-Engine` diagnostic header on hits.
    pub response_header: bool,
    pub pingback_header: bool,
    pub shortlink_header: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_template: DEFAULT_KEY_TEMPLATE.to_string(),
            prefix_data: DEFAULT_PREFIX_DATA.to_string(),
            prefix_meta: DEFAULT_PREFIX_META.to_string(),
            hash_keys: false,
            expire: DEFAULT_EXPIRE_SECS,
            expire_home: DEFAULT_EXPIRE_HOME_SECS,
            expire_taxonomy: DEFAULT_EXPIRE_TAXONOMY_SECS,
            expire_single: DEFAULT_EXPIRE_SINGLE_SECS,
            nocache_home: false,
            nocache_feed: false,
            nocache_archive: false,
            nocache_single: false,
            nocache_cookies: Vec::new(),
            nocache_url: None,
            cache_logged_in: false,
            logged_in_cookie_prefix: DEFAULT_LOGGED_IN_COOKIE_PREFIX.to_string(),
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            invalidation_mode: InvalidationMode::default(),
            response_header: true,
            pingback_header: false,
            shortlink_header: false,
        }
    }
}

impl CacheConfig {
    /// TTL in seconds for a classified page.
    pub fn ttl_for(&self, kind: PageKind) -> u64 {
        match kind {
            PageKind::Home => self.expire_home,
            PageKind::Archive => self.expire_taxonomy,
            PageKind::Single => self.expire_single,
            PageKind::Feed | PageKind::Unknown => self.expire,
        }
    }

    /// Whether caching is switched off for a page type.
    ///
    /// Types without a suppression flag are always cacheable.
    pub fn suppresses(&self, kind: PageKind) -> bool {
        match kind {
            PageKind::Home => self.nocache_home,
            PageKind::Feed => self.nocache_feed,
            PageKind::Archive => self.nocache_archive,
            PageKind::Single => self.nocache_single,
            PageKind::Unknown => false,
        }
    }

    /// True when either prefix differs from the shipped defaults.
    pub fn uses_custom_prefixes(&self) -> bool {
        self.prefix_data != DEFAULT_PREFIX_DATA || self.prefix_meta != DEFAULT_PREFIX_META
    }
}

/// Settings shared by every host served by one gateway.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Master switch; when off every request bypasses.
    pub enabled: bool,
    /// Marker cookie set for privileged viewers.
    pub nocache_cookie: String,
    /// Lifetime of the marker cookie in seconds.
    pub nocache_cookie_ttl: u64,
    /// Scheme assumed when neither the URI nor `X-Forwarded-Proto` carries one.
    pub default_scheme: String,
    /// Generated bodies above this size are passed through without storing.
    pub max_body_bytes: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            nocache_cookie: DEFAULT_NOCACHE_COOKIE.to_string(),
            nocache_cookie_ttl: DEFAULT_NOCACHE_COOKIE_TTL_SECS,
            default_scheme: "http".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Host → configuration lookup table.
#[derive(Debug, Clone, Default)]
pub struct SiteConfigs {
    sites: HashMap<String, Arc<CacheConfig>>,
}

impl SiteConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host. `*` acts as a fallback for unlisted hosts.
    pub fn insert(&mut self, host: impl AsRef<str>, config: CacheConfig) {
        self.sites
            .insert(normalize_host(host.as_ref()), Arc::new(config));
    }

    pub fn with_site(mut self, host: impl AsRef<str>, config: CacheConfig) -> Self {
        self.insert(host, config);
        self
    }

    /// Find the snapshot for a request host.
    ///
    /// Tries the exact host (including any port), then the host without its
    /// port, then the wildcard entry.
    pub fn for_host(&self, host: &str) -> Option<Arc<CacheConfig>> {
        let host = normalize_host(host);
        if let Some(config) = self.sites.get(&host) {
            return Some(Arc::clone(config));
        }
        if let Some((bare, _port)) = host.rsplit_once(':')
            && !bare.ends_with(']')
            && let Some(config) = self.sites.get(bare)
        {
            return Some(Arc::clone(config));
        }
        self.sites.get(WILDCARD_HOST).map(Arc::clone)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.key_template, "$scheme://$host$request_uri");
        assert_eq!(config.prefix_data, "data-");
        assert_eq!(config.prefix_meta, "meta-");
        assert_eq!(config.invalidation_mode, InvalidationMode::Resource);
        assert!(!config.cache_logged_in);
        assert!(!config.uses_custom_prefixes());
    }

    #[test]
    fn ttl_follows_page_kind() {
        let config = CacheConfig {
            expire: 10,
            expire_home: 20,
            expire_taxonomy: 30,
            expire_single: 40,
            ..Default::default()
        };
        assert_eq!(config.ttl_for(PageKind::Home), 20);
        assert_eq!(config.ttl_for(PageKind::Archive), 30);
        assert_eq!(config.ttl_for(PageKind::Single), 40);
        assert_eq!(config.ttl_for(PageKind::Feed), 10);
        assert_eq!(config.ttl_for(PageKind::Unknown), 10);
    }

    #[test]
    fn unknown_pages_are_never_suppressed() {
        let config = CacheConfig {
            nocache_home: true,
            nocache_feed: true,
            nocache_archive: true,
            nocache_single: true,
            ..Default::default()
        };
        assert!(config.suppresses(PageKind::Feed));
        assert!(config.suppresses(PageKind::Single));
        assert!(!config.suppresses(PageKind::Unknown));
    }

    #[test]
    fn host_lookup_falls_back_through_port_and_wildcard() {
        let sites = SiteConfigs::new()
            .with_site("Shop.Example.com", CacheConfig::default())
            .with_site(
                "*",
                CacheConfig {
                    expire: 1,
                    ..Default::default()
                },
            );

        let exact = sites.for_host("shop.example.com").expect("exact host");
        assert_eq!(exact.expire, DEFAULT_EXPIRE_SECS);

        let with_port = sites.for_host("shop.example.com:8080").expect("port stripped");
        assert_eq!(with_port.expire, DEFAULT_EXPIRE_SECS);

        let other = sites.for_host("other.example.com").expect("wildcard");
        assert_eq!(other.expire, 1);
    }

    #[test]
    fn host_lookup_without_wildcard_misses() {
        let sites = SiteConfigs::new().with_site("shop.example.com", CacheConfig::default());
        assert!(sites.for_host("elsewhere.example.com").is_none());
    }

    #[test]
    fn invalidation_mode_parsing() {
        assert_eq!(InvalidationMode::parse("ALL"), Some(InvalidationMode::Flush));
        assert_eq!(
            InvalidationMode::parse("taxonomies"),
            Some(InvalidationMode::Taxonomies)
        );
        assert_eq!(InvalidationMode::parse("index"), Some(InvalidationMode::Index));
        assert_eq!(InvalidationMode::parse("bogus"), None);
    }
}
