//! Content mutation events.

use super::invalidation::ResourceId;

/// Monotonic sequence number assigned when an event is handled.
pub type Epoch = u64;

/// Something changed in the host's content or presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationEvent {
    /// A comment on the resource was added, edited or moderated.
    CommentChanged { resource: ResourceId },
    /// The resource was created, edited or had its status changed.
    ResourceUpdated { resource: ResourceId },
    /// The resource was trashed or deleted.
    ResourceDeleted { resource: ResourceId },
    /// The active theme changed; every page renders differently.
    ThemeSwitched,
    /// Cache or site settings changed.
    ConfigChanged,
}

impl MutationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationEvent::CommentChanged { .. } => "comment_changed",
            MutationEvent::ResourceUpdated { .. } => "resource_updated",
            MutationEvent::ResourceDeleted { .. } => "resource_deleted",
            MutationEvent::ThemeSwitched => "theme_switched",
            MutationEvent::ConfigChanged => "config_changed",
        }
    }

    /// The resource the event is about; `None` for site-wide events.
    pub fn resource(&self) -> Option<ResourceId> {
        match self {
            MutationEvent::CommentChanged { resource }
            | MutationEvent::ResourceUpdated { resource }
            | MutationEvent::ResourceDeleted { resource } => Some(*resource),
            MutationEvent::ThemeSwitched | MutationEvent::ConfigChanged => None,
        }
    }

    /// Site-wide events flush regardless of the invalidation mode.
    pub fn is_site_wide(&self) -> bool {
        self.resource().is_none()
    }
}
