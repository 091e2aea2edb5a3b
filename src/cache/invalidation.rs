//! Invalidation planning and execution.
//!
//! [`plan_invalidation`] works out which logical resources a mutation
//! touches; [`Invalidator`] turns that plan into backend deletes.

use std::collections::{BTreeMap, BTreeSet};

use metrics::counter;
use tracing::{debug, info, warn};

use super::config::{CacheConfig, InvalidationMode};
use super::keys::{CacheKey, KeyBuilder, ResourceIdentity};
use super::store::PageStore;

/// Splits one content item into several pages.
pub const PAGE_BREAK_MARKER: &str = "<!--nextpage-->";

pub type ResourceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceKind {
    /// A dated entry that appears on the posts index.
    Post,
    Page,
    Product,
    #[default]
    Other,
}

/// A public taxonomy term attached to a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermLink {
    /// URL segment of the taxonomy, e.g. `category` or `product-tag`.
    pub taxonomy: String,
    pub permalink: String,
}

impl TermLink {
    pub fn new(taxonomy: impl Into<String>, permalink: impl Into<String>) -> Self {
        Self {
            taxonomy: taxonomy.into(),
            permalink: permalink.into(),
        }
    }
}

/// Read-only view of the host's content graph.
pub trait ContentRelations: Send + Sync {
    fn permalink(&self, id: ResourceId) -> Option<String>;
    fn content(&self, id: ResourceId) -> Option<String>;
    fn kind(&self, id: ResourceId) -> ResourceKind;
    fn public_terms(&self, id: ResourceId) -> Vec<TermLink>;
    /// The page that lists posts, when the site has one.
    fn posts_index(&self) -> Option<ResourceId>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticResource {
    pub permalink: String,
    pub content: String,
    pub kind: ResourceKind,
    pub terms: Vec<TermLink>,
}

/// In-memory [`ContentRelations`] for hosts that push snapshots, and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticContent {
    resources: BTreeMap<ResourceId, StaticResource>,
    posts_index: Option<ResourceId>,
}

impl StaticContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, id: ResourceId, resource: StaticResource) -> Self {
        self.resources.insert(id, resource);
        self
    }

    pub fn with_posts_index(mut self, id: ResourceId) -> Self {
        self.posts_index = Some(id);
        self
    }
}

impl ContentRelations for StaticContent {
    fn permalink(&self, id: ResourceId) -> Option<String> {
        self.resources
            .get(&id)
            .map(|resource| resource.permalink.clone())
            .filter(|permalink| !permalink.is_empty())
    }

    fn content(&self, id: ResourceId) -> Option<String> {
        self.resources.get(&id).map(|resource| resource.content.clone())
    }

    fn kind(&self, id: ResourceId) -> ResourceKind {
        self.resources
            .get(&id)
            .map(|resource| resource.kind)
            .unwrap_or_default()
    }

    fn public_terms(&self, id: ResourceId) -> Vec<TermLink> {
        self.resources
            .get(&id)
            .map(|resource| resource.terms.clone())
            .unwrap_or_default()
    }

    fn posts_index(&self) -> Option<ResourceId> {
        self.posts_index
    }
}

/// Permalinks pending deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationSet(BTreeMap<String, bool>);

impl InvalidationSet {
    pub fn insert(&mut self, permalink: impl Into<String>) {
        self.0.insert(permalink.into(), true);
    }

    pub fn contains(&self, permalink: &str) -> bool {
        self.0.contains_key(permalink)
    }

    pub fn permalinks(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    FlushAll,
    Purge(InvalidationSet),
    /// The resource has no permalink; nothing is deleted.
    Unresolved(ResourceId),
}

pub fn plan_invalidation(
    id: ResourceId,
    relations: &dyn ContentRelations,
    mode: InvalidationMode,
) -> Plan {
    if mode == InvalidationMode::Flush {
        return Plan::FlushAll;
    }
    let mut set = InvalidationSet::default();
    let mut visited = BTreeSet::new();
    if collect(id, relations, mode, &mut set, &mut visited) {
        Plan::Purge(set)
    } else {
        Plan::Unresolved(id)
    }
}

fn collect(
    id: ResourceId,
    relations: &dyn ContentRelations,
    mode: InvalidationMode,
    set: &mut InvalidationSet,
    visited: &mut BTreeSet<ResourceId>,
) -> bool {
    if !visited.insert(id) {
        return true;
    }
    let Some(permalink) = relations.permalink(id) else {
        return false;
    };

    let pages = relations
        .content(id)
        .map(|content| content.matches(PAGE_BREAK_MARKER).count())
        .unwrap_or(0);
    for link in paginated_permalinks(&permalink, pages) {
        set.insert(link);
    }

    if mode.includes_taxonomies() {
        for term in relations.public_terms(id) {
            if let Some(stripped) = strip_taxonomy_segment(&term.permalink, &term.taxonomy) {
                set.insert(stripped);
            }
            set.insert(term.permalink);
        }
    }

    if mode.includes_index()
        && relations.kind(id) == ResourceKind::Post
        && let Some(index) = relations.posts_index()
        && index != id
    {
        let resolved = collect(index, relations, mode, set, visited);
        if !resolved {
            debug!(index, "Posts index has no permalink; skipping it");
        }
    }
    true
}

/// The root permalink (page one) followed by `<root><n>/` for pages two onward.
pub fn paginated_permalinks(root: &str, breaks: usize) -> Vec<String> {
    let mut links = Vec::with_capacity(breaks + 1);
    links.push(root.to_string());
    let base = if root.ends_with('/') {
        root.to_string()
    } else {
        format!("{root}/")
    };
    links.extend((2..=breaks + 1).map(|page| format!("{base}{page}/")));
    links
}

/// `https://shop/category/shoes/` with taxonomy `category` → `https://shop/shoes/`.
///
/// `None` when the segment is absent or the permalink does not parse.
pub fn strip_taxonomy_segment(permalink: &str, taxonomy: &str) -> Option<String> {
    if taxonomy.is_empty() {
        return None;
    }
    let identity = ResourceIdentity::from_permalink(permalink).ok()?;
    let needle = format!("/{taxonomy}/");
    let at = identity.path.find(&needle)?;
    let mut path = identity.path.clone();
    path.replace_range(at..at + needle.len(), "/");
    Some(ResourceIdentity { path, ..identity }.permalink())
}

/// Data and meta keys for every permalink and its feed.
pub fn expand_keys(set: &InvalidationSet, config: &CacheConfig) -> Vec<CacheKey> {
    let mut identities = Vec::with_capacity(set.len() * 2);
    for permalink in set.permalinks() {
        match ResourceIdentity::from_permalink(permalink) {
            Ok(identity) => {
                identities.push(identity.feed_variant());
                identities.push(identity);
            }
            Err(err) => warn!(permalink, error = %err, "Skipping unparseable permalink"),
        }
    }
    KeyBuilder::new(config).build_keys(&identities)
}

/// Executes plans against the store.
#[derive(Debug, Clone)]
pub struct Invalidator {
    store: PageStore,
}

impl Invalidator {
    pub fn new(store: PageStore) -> Self {
        Self { store }
    }

    /// Plan and execute the invalidation for one resource.
    pub async fn invalidate(
        &self,
        id: ResourceId,
        relations: &dyn ContentRelations,
        config: &CacheConfig,
    ) -> bool {
        let plan = plan_invalidation(id, relations, config.invalidation_mode);
        self.execute(plan, config).await
    }

    pub async fn execute(&self, plan: Plan, config: &CacheConfig) -> bool {
        match plan {
            Plan::FlushAll => self.flush().await,
            Plan::Unresolved(id) => {
                warn!(resource = id, "Cannot resolve permalink; nothing invalidated");
                false
            }
            Plan::Purge(set) => self.purge(&set, config).await,
        }
    }

    pub async fn flush(&self) -> bool {
        let flushed = self.store.flush().await;
        if flushed {
            info!(cache = self.store.engine(), "Flushed page cache");
        }
        flushed
    }

    /// Purge explicit permalinks, each with `pages` sub-pages.
    pub async fn purge_permalinks(
        &self,
        permalinks: &[String],
        pages: usize,
        config: &CacheConfig,
    ) -> bool {
        let mut set = InvalidationSet::default();
        for permalink in permalinks {
            for link in paginated_permalinks(permalink, pages) {
                set.insert(link);
            }
        }
        self.purge(&set, config).await
    }

    async fn purge(&self, set: &InvalidationSet, config: &CacheConfig) -> bool {
        let keys = expand_keys(set, config);
        let mut deleted = 0_u64;
        for key in &keys {
            if self.store.delete(key).await {
                deleted += 1;
            }
        }
        counter!("pagegate_invalidated_keys_total").increment(deleted);
        debug!(
            identities = set.len(),
            keys = keys.len(),
            deleted,
            "Invalidated page cache entries"
        );
        deleted > 0
    }
}
