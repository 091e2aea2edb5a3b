//! Store adapter.
//!
//! [`PageStore`] is the only path the gateway uses to reach a backend. It is
//! fail-open: backend errors are logged and counted, then reported as a miss
//! (`None`) or `false`, so callers behave exactly as with a cold cache.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use super::entry::PageKind;
use super::keys::CacheKey;
use super::lock::lock_recovering;

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("unexpected backend reply: {0}")]
    Protocol(String),
    #[error("key rejected: {0}")]
    InvalidKey(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("backend reported an error: {0}")]
    Server(String),
    #[error("no live backend endpoint")]
    NotAlive,
}

impl StoreError {
    /// Errors after which the connection can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::Timeout(_)
                | StoreError::Protocol(_)
                | StoreError::Auth(_)
        )
    }
}

/// A key-value backend the page store can sit on.
///
/// `ttl` is in seconds, 0 meaning no expiration.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Label reported in the `X-Cache-Engine` header and status output.
    fn name(&self) -> &'static str;
    fn is_alive(&self) -> bool;
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    async fn set(&self, key: &str, value: Bytes, ttl: u32) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    async fn flush(&self) -> Result<(), StoreError>;
    /// Per-endpoint health, 1 for healthy.
    async fn status_probe(&self) -> BTreeMap<String, u8>;
}

/// Overrides the backend TTL for a page classification.
pub type TtlHook = Arc<dyn Fn(PageKind, u64) -> u64 + Send + Sync>;

#[derive(Clone)]
pub struct PageStore {
    backend: Arc<dyn Backend>,
    ttl_hook: Option<TtlHook>,
}

impl fmt::Debug for PageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStore")
            .field("backend", &self.backend.name())
            .field("alive", &self.backend.is_alive())
            .field("ttl_hook", &self.ttl_hook.is_some())
            .finish()
    }
}

impl PageStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            ttl_hook: None,
        }
    }

    /// Store backed by an in-process LRU.
    pub fn memory(capacity: NonZeroUsize) -> Self {
        Self::new(Arc::new(MemoryBackend::new(capacity)))
    }

    pub fn with_ttl_hook(mut self, hook: TtlHook) -> Self {
        self.ttl_hook = Some(hook);
        self
    }

    pub fn engine(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_alive(&self) -> bool {
        self.backend.is_alive()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        if !self.is_alive() {
            return None;
        }
        match self.backend.get(key.as_str()).await {
            Ok(value) => value,
            Err(err) => {
                report("get", key.as_str(), &err);
                None
            }
        }
    }

    /// Write `value` with a TTL already passed through the hook.
    pub async fn set(&self, key: &CacheKey, value: Bytes, kind: PageKind, ttl: u64) -> bool {
        if !self.is_alive() {
            return false;
        }
        let ttl = self.effective_ttl(kind, ttl);
        match self.backend.set(key.as_str(), value, ttl).await {
            Ok(()) => true,
            Err(err) => {
                report("set", key.as_str(), &err);
                false
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.backend.delete(key.as_str()).await {
            Ok(deleted) => deleted,
            Err(err) => {
                report("delete", key.as_str(), &err);
                false
            }
        }
    }

    pub async fn flush(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.backend.flush().await {
            Ok(()) => {
                counter!("pagegate_flush_total").increment(1);
                debug!(cache = self.engine(), "Backend flushed");
                true
            }
            Err(err) => {
                report("flush", "*", &err);
                false
            }
        }
    }

    pub async fn status_probe(&self) -> BTreeMap<String, u8> {
        self.backend.status_probe().await
    }

    fn effective_ttl(&self, kind: PageKind, ttl: u64) -> u32 {
        let ttl = match &self.ttl_hook {
            Some(hook) => hook(kind, ttl),
            None => ttl,
        };
        u32::try_from(ttl).unwrap_or(u32::MAX)
    }
}

fn report(op: &'static str, key: &str, err: &StoreError) {
    if matches!(err, StoreError::NotAlive) {
        debug!(op, key, "Endpoint for key is down; treating as miss");
        return;
    }
    counter!("pagegate_backend_error_total", "op" => op).increment(1);
    warn!(op, key, error = %err, "Backend call failed; treating as miss");
}

struct MemoryEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// Single-node backend: an LRU with per-entry expiry.
pub struct MemoryBackend {
    entries: Mutex<LruCache<String, MemoryEntry>>,
    alive: AtomicBool,
}

impl MemoryBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            alive: AtomicBool::new(true),
        }
    }

    /// Take the backend offline or back online.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock_recovering(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut entries = lock_recovering(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at.is_some_and(|at| at <= Instant::now()),
        };
        if expired {
            entries.pop(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: u32) -> Result<(), StoreError> {
        let expires_at = (ttl > 0).then(|| Instant::now() + Duration::from_secs(u64::from(ttl)));
        lock_recovering(&self.entries, SOURCE, "set")
            .put(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(lock_recovering(&self.entries, SOURCE, "delete")
            .pop(key)
            .is_some())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        lock_recovering(&self.entries, SOURCE, "flush").clear();
        Ok(())
    }

    async fn status_probe(&self) -> BTreeMap<String, u8> {
        BTreeMap::from([("memory".to_string(), u8::from(self.is_alive()))])
    }
}
