//! Page cache middleware.
//!
//! Wraps the storefront router: bypassed requests go straight through, hits
//! are replayed from the store, misses are generated and captured.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use metrics::counter;
use tracing::{debug, instrument};

use super::bypass;
use super::capture::{self, BodyTransform, CaptureEnv, CaptureScope};
use super::clock::{Clock, SystemClock};
use super::config::{GatewayOptions, SiteConfigs};
use super::context::RequestContext;
use super::keys::KeyBuilder;
use super::replay;
use super::store::PageStore;

/// Shared gateway state for the middleware.
#[derive(Clone)]
pub struct PageCache {
    options: Arc<GatewayOptions>,
    sites: Arc<SiteConfigs>,
    store: PageStore,
    clock: Arc<dyn Clock>,
    transform: Option<BodyTransform>,
}

impl PageCache {
    pub fn new(options: GatewayOptions, sites: SiteConfigs, store: PageStore) -> Self {
        Self {
            options: Arc::new(options),
            sites: Arc::new(sites),
            store,
            clock: Arc::new(SystemClock),
            transform: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Rewrite stored bodies, e.g. to minify them.
    pub fn with_body_transform(mut self, transform: BodyTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub fn sites(&self) -> &SiteConfigs {
        &self.sites
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(cache): State<PageCache>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ctx = RequestContext::from_request(&request, &cache.options, &cache.sites);
    let engine = cache.store.engine();

    let verdict = bypass::evaluate(&ctx, &cache.options, cache.store.is_alive());
    let config = match (verdict, ctx.config.clone()) {
        (None, Some(config)) => config,
        (reason, _) => {
            let reason = reason.map_or("no_site_config", |reason| reason.as_str());
            counter!("pagegate_bypass_total", "reason" => reason).increment(1);
            debug!(cache = engine, outcome = "bypass", reason, "Bypassing page cache");
            let mut response = next.run(request).await;
            if ctx.viewer.is_privileged() {
                capture::mark_privileged(&mut response, &ctx, &cache.options);
            }
            return response;
        }
    };

    let keys = KeyBuilder::new(&config);
    let identity = ctx.identity();
    match replay::lookup(&cache.store, &keys, &identity).await {
        Ok(entry) => {
            let replayed = replay::replay(&entry, &ctx, &config, engine, cache.clock.now());
            counter!("pagegate_hit_total").increment(1);
            debug!(
                cache = engine,
                outcome = "hit",
                replay = replayed.outcome.as_str(),
                "Serving cached page"
            );
            return replayed.response;
        }
        Err(reason) => {
            counter!("pagegate_miss_total").increment(1);
            debug!(cache = engine, outcome = "miss", reason = reason.as_str(), "Generating page");
        }
    }

    let scope = CaptureScope::begin(identity);
    let response = next.run(request).await;
    let env = CaptureEnv {
        store: &cache.store,
        config: &config,
        options: &cache.options,
        transform: cache.transform.as_ref(),
        now: cache.clock.now(),
    };
    scope.complete(response, &ctx, &env).await
}
