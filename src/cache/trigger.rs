//! Cache trigger service.
//!
//! The host calls one method per mutation after its write has committed; the
//! trigger plans and executes the matching invalidation right away.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use super::config::CacheConfig;
use super::events::{Epoch, MutationEvent};
use super::invalidation::{ContentRelations, Invalidator, Plan, ResourceId, plan_invalidation};
use super::store::PageStore;

/// Invalidation entry point for one site.
pub struct CacheTrigger {
    enabled: bool,
    config: Arc<CacheConfig>,
    invalidator: Invalidator,
    content: Arc<dyn ContentRelations>,
    epoch: AtomicU64,
}

impl CacheTrigger {
    pub fn new(
        config: Arc<CacheConfig>,
        store: PageStore,
        content: Arc<dyn ContentRelations>,
    ) -> Self {
        Self {
            enabled: true,
            config,
            invalidator: Invalidator::new(store),
            content,
            epoch: AtomicU64::new(0),
        }
    }

    /// Turn every trigger into a logged no-op.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Handle an event. Returns `true` when anything was deleted or flushed.
    pub async fn trigger(&self, event: MutationEvent) -> bool {
        if !self.enabled {
            debug!(event_kind = event.as_str(), "Cache trigger skipped: cache disabled");
            return false;
        }
        let epoch: Epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        info!(
            event_epoch = epoch,
            event_kind = event.as_str(),
            resource = ?event.resource(),
            mode = self.config.invalidation_mode.as_str(),
            "Cache event received"
        );

        let plan = match event.resource() {
            None => Plan::FlushAll,
            Some(resource) => plan_invalidation(
                resource,
                self.content.as_ref(),
                self.config.invalidation_mode,
            ),
        };
        self.invalidator.execute(plan, &self.config).await
    }

    pub async fn comment_changed(&self, resource: ResourceId) -> bool {
        self.trigger(MutationEvent::CommentChanged { resource }).await
    }

    pub async fn resource_updated(&self, resource: ResourceId) -> bool {
        self.trigger(MutationEvent::ResourceUpdated { resource }).await
    }

    pub async fn resource_deleted(&self, resource: ResourceId) -> bool {
        self.trigger(MutationEvent::ResourceDeleted { resource }).await
    }

    pub async fn theme_switched(&self) -> bool {
        self.trigger(MutationEvent::ThemeSwitched).await
    }

    pub async fn config_changed(&self) -> bool {
        self.trigger(MutationEvent::ConfigChanged).await
    }
}
