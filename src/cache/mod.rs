//! Full-page cache gateway.
//!
//! Every request passes the [`bypass`] rules first. Eligible requests are
//! looked up by key ([`keys`]) and replayed from the store ([`replay`]); on a
//! miss the downstream router generates the page and [`capture`] stores it.
//! Content mutations reach [`CacheTrigger`], which purges affected keys
//! ([`invalidation`]).
//!
//! ## Configuration
//!
//! Per-host settings live under `[[sites]]` in `pagegate.toml`:
//!
//! ```toml
//! [[sites]]
//! host = "shop.example"
//! expire_single = 3600
//! invalidation_mode = "taxonomies"
//! ```

pub mod bypass;
pub mod capture;
pub mod clock;
pub mod config;
pub mod context;
pub mod entry;
pub mod events;
pub mod invalidation;
pub mod keys;
pub(crate) mod lock;
mod middleware;
pub mod replay;
pub mod store;
mod trigger;

pub use bypass::BypassReason;
pub use capture::{BodyTransform, CaptureScope, PageSignals};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, GatewayOptions, InvalidationMode, SiteConfigs};
pub use context::{RequestContext, Viewer};
pub use entry::{CacheEntry, MetaRecord, PageKind};
pub use events::MutationEvent;
pub use invalidation::{
    ContentRelations, InvalidationSet, Invalidator, PAGE_BREAK_MARKER, ResourceId, ResourceKind,
    StaticContent, StaticResource, TermLink,
};
pub use keys::{CacheKey, EntryKind, KeyBuilder, ResourceIdentity};
pub use middleware::{PageCache, page_cache_layer};
pub use store::{Backend, MemoryBackend, PageStore, StoreError, TtlHook};
pub use trigger::CacheTrigger;
