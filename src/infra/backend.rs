//! Builds the page store selected by [`BackendSettings`].

use std::sync::Arc;

use tracing::info;

use crate::cache::PageStore;
use crate::config::{BackendEngine, BackendSettings};

use super::memcached::{ConnectOptions, MemcachedPool};

/// Connect to the configured backend.
///
/// Unreachable memcached endpoints do not fail startup; they start dead and
/// are retried on use, so the gateway comes up serving uncached pages.
pub async fn connect(settings: &BackendSettings) -> PageStore {
    match settings.engine {
        BackendEngine::Memory => {
            info!(capacity = settings.memory_capacity.get(), "Using in-process page store");
            PageStore::memory(settings.memory_capacity)
        }
        BackendEngine::Memcached => {
            let options = ConnectOptions {
                protocol: settings.protocol,
                connect_timeout: settings.connect_timeout,
                io_timeout: settings.io_timeout,
                credentials: settings.credentials.clone(),
            };
            let pool = MemcachedPool::connect(
                settings.servers.clone(),
                options,
                settings.reconnect_interval,
            )
            .await;
            info!(
                servers = settings.servers.len(),
                protocol = ?settings.protocol,
                "Using memcached page store"
            );
            PageStore::new(Arc::new(pool))
        }
    }
}
