//! Capture of generated pages and population of the store.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use axum_extra::extract::cookie::Cookie;
use bytes::Bytes;
use http_body_util::BodyExt;
use metrics::counter;
use tracing::{debug, warn};

use super::config::{CacheConfig, GatewayOptions};
use super::context::RequestContext;
use super::entry::{DEFAULT_MIME, MetaRecord, PageKind};
use super::keys::{KeyBuilder, ResourceIdentity};
use super::store::PageStore;

/// Markers that close a complete document.
const CLOSING_MARKERS: [&[u8]; 4] = [b"</html>", b"</body>", b"</rss>", b"</feed>"];

/// Facts about a page only the renderer knows. Handlers attach it as a
/// response extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSignals {
    pub kind: Option<PageKind>,
    /// Epoch seconds of the newest content on the page.
    pub last_modified: Option<i64>,
    pub shortlink: Option<String>,
    pub pingback: Option<String>,
    /// The renderer produced its not-found page.
    pub not_found: bool,
}

impl PageSignals {
    pub fn of_kind(kind: PageKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn last_modified(mut self, epoch_seconds: i64) -> Self {
        self.last_modified = Some(epoch_seconds);
        self
    }
}

/// Rewrites the bytes that get stored. The viewer always receives the
/// untransformed body.
pub type BodyTransform = Arc<dyn Fn(PageKind, Bytes) -> Bytes + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Privileged,
    Empty,
    Unterminated,
    Status,
    SetsCookie,
    Suppressed,
    TooLarge,
    Unreadable,
    StoreFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Privileged => "privileged",
            SkipReason::Empty => "empty",
            SkipReason::Unterminated => "unterminated",
            SkipReason::Status => "status",
            SkipReason::SetsCookie => "sets_cookie",
            SkipReason::Suppressed => "suppressed",
            SkipReason::TooLarge => "too_large",
            SkipReason::Unreadable => "unreadable",
            SkipReason::StoreFailed => "store_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Store { meta: MetaRecord, ttl: u64 },
    Skip(SkipReason),
}

/// What the renderer produced, as seen by the capture policy.
#[derive(Debug)]
pub struct Generated<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub signals: Option<&'a PageSignals>,
}

/// Decide whether and how a generated page is stored.
pub fn decide(generated: &Generated<'_>, path: &str, config: &CacheConfig, now: i64) -> Decision {
    let status = generated.status.as_u16();
    let location = generated
        .headers
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok());
    let is_redirect = matches!(status, 301 | 302 | 303 | 307 | 308);

    if !(status == 200 || status == 404 || is_redirect) {
        return Decision::Skip(SkipReason::Status);
    }
    if is_redirect && location.is_none() {
        return Decision::Skip(SkipReason::Status);
    }
    if generated.headers.contains_key(header::SET_COOKIE) {
        return Decision::Skip(SkipReason::SetsCookie);
    }
    if !is_redirect {
        if generated.body.iter().all(u8::is_ascii_whitespace) {
            return Decision::Skip(SkipReason::Empty);
        }
        if !has_closing_marker(generated.body) {
            return Decision::Skip(SkipReason::Unterminated);
        }
    }

    let mime = generated
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(DEFAULT_MIME)
        .to_string();
    let signals = generated.signals.cloned().unwrap_or_default();
    let kind = signals.kind.unwrap_or_else(|| PageKind::infer(path, &mime));
    if config.suppresses(kind) {
        return Decision::Skip(SkipReason::Suppressed);
    }

    let ttl = config.ttl_for(kind);
    let expire = (ttl > 0).then(|| now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)));
    let meta = MetaRecord {
        kind,
        expire,
        lastmodified: signals.last_modified,
        status: (status == 404 || signals.not_found).then_some(404),
        redirect: if is_redirect { location.map(str::to_string) } else { None },
        mime,
        shortlink: signals.shortlink.filter(|_| config.shortlink_header),
        pingback: signals.pingback.filter(|_| config.pingback_header),
    };
    Decision::Store { meta, ttl }
}

fn has_closing_marker(body: &[u8]) -> bool {
    CLOSING_MARKERS.iter().any(|marker| {
        body.windows(marker.len())
            .any(|window| window.eq_ignore_ascii_case(marker))
    })
}

/// Attach the do-not-cache marker cookie unless the viewer already has it.
pub fn mark_privileged(response: &mut Response, ctx: &RequestContext, options: &GatewayOptions) {
    if ctx.cookie(&options.nocache_cookie).is_some() {
        return;
    }
    let max_age = i64::try_from(options.nocache_cookie_ttl).unwrap_or(i64::MAX);
    let cookie = Cookie::build((options.nocache_cookie.clone(), "1"))
        .path("/")
        .max_age(time::Duration::seconds(max_age))
        .http_only(true)
        .build();
    match HeaderValue::from_str(&cookie.to_string()) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(err) => warn!(error = %err, "Could not encode do-not-cache cookie"),
    }
}

/// Everything populate needs besides the response.
pub struct CaptureEnv<'a> {
    pub store: &'a PageStore,
    pub config: &'a CacheConfig,
    pub options: &'a GatewayOptions,
    pub transform: Option<&'a BodyTransform>,
    pub now: i64,
}

/// Guard around page generation for one cache miss.
///
/// Dropping it without [`CaptureScope::complete`] means generation was
/// cancelled or panicked; nothing is written in that case.
#[derive(Debug)]
pub struct CaptureScope {
    identity: ResourceIdentity,
    finished: bool,
}

impl CaptureScope {
    pub fn begin(identity: ResourceIdentity) -> Self {
        Self {
            identity,
            finished: false,
        }
    }

    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// Inspect the generated response, store it when policy allows, and hand
    /// back an equivalent response for the viewer.
    pub async fn complete(
        mut self,
        response: Response,
        ctx: &RequestContext,
        env: &CaptureEnv<'_>,
    ) -> Response {
        let response = self.populate(response, ctx, env).await;
        self.finished = true;
        response
    }

    async fn populate(
        &self,
        mut response: Response,
        ctx: &RequestContext,
        env: &CaptureEnv<'_>,
    ) -> Response {
        if ctx.viewer.is_privileged() {
            skipped(SkipReason::Privileged, &self.identity);
            mark_privileged(&mut response, ctx, env.options);
            return response;
        }

        let declared_len = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared_len.is_some_and(|len| len > env.options.max_body_bytes) {
            skipped(SkipReason::TooLarge, &self.identity);
            return response;
        }

        let (mut parts, body) = response.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(identity = %self.identity, error = %err, "Failed to buffer generated page");
                skipped(SkipReason::Unreadable, &self.identity);
                parts.headers.remove(header::CONTENT_LENGTH);
                return Response::from_parts(parts, Body::empty());
            }
        };
        if bytes.len() > env.options.max_body_bytes {
            skipped(SkipReason::TooLarge, &self.identity);
            return Response::from_parts(parts, Body::from(bytes));
        }

        let generated = Generated {
            status: parts.status,
            headers: &parts.headers,
            body: &bytes,
            signals: parts.extensions.get::<PageSignals>(),
        };
        match decide(&generated, &ctx.path, env.config, env.now) {
            Decision::Skip(reason) => skipped(reason, &self.identity),
            Decision::Store { meta, ttl } => {
                let stored = match (meta.redirect.as_deref(), env.transform) {
                    // Redirects carry no document; the target keeps the data entry non-empty.
                    (Some(location), _) if bytes.is_empty() => Bytes::from(location.to_string()),
                    (None, Some(transform)) => transform(meta.kind, bytes.clone()),
                    _ => bytes.clone(),
                };
                if self.write(env, &meta, stored, ttl).await {
                    counter!("pagegate_store_total").increment(1);
                    debug!(
                        cache = env.store.engine(),
                        outcome = "stored",
                        identity = %self.identity,
                        kind = meta.kind.as_str(),
                        ttl,
                        "Stored generated page"
                    );
                } else {
                    skipped(SkipReason::StoreFailed, &self.identity);
                }
            }
        }
        Response::from_parts(parts, Body::from(bytes))
    }

    /// Meta first, then data; a reader needs both.
    async fn write(&self, env: &CaptureEnv<'_>, meta: &MetaRecord, data: Bytes, ttl: u64) -> bool {
        let (data_key, meta_key) = KeyBuilder::new(env.config).build_pair(&self.identity);
        env.store.set(&meta_key, meta.encode(), meta.kind, ttl).await
            && env.store.set(&data_key, data, meta.kind, ttl).await
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        if !self.finished {
            counter!("pagegate_capture_skipped_total", "reason" => "abandoned").increment(1);
            warn!(identity = %self.identity, "Page generation abandoned; nothing cached");
        }
    }
}

fn skipped(reason: SkipReason, identity: &ResourceIdentity) {
    counter!("pagegate_capture_skipped_total", "reason" => reason.as_str()).increment(1);
    debug!(identity = %identity, reason = reason.as_str(), "Generated page not cached");
}
