//! Lookup and replay of stored pages.
//!
//! [`lookup`] does the I/O; [`replay`] turns a complete entry into the
//! response for this request without touching the backend.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::util::http_date::format_http_date;

use super::config::CacheConfig;
use super::context::RequestContext;
use super::entry::{CacheEntry, DEFAULT_MIME, MetaRecord};
use super::keys::{KeyBuilder, ResourceIdentity};
use super::store::PageStore;

pub const CACHE_ENGINE_HEADER: HeaderName = HeaderName::from_static("x-cache-engine");
pub const PINGBACK_HEADER: HeaderName = HeaderName::from_static("x-pingback");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// No meta entry.
    Absent,
    /// One half of the pair is missing or empty.
    Incomplete,
    /// Meta entry could not be decoded.
    Corrupt,
}

impl MissReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissReason::Absent => "absent",
            MissReason::Incomplete => "incomplete",
            MissReason::Corrupt => "corrupt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Serve,
    Redirect,
    NotModified,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Serve => "serve",
            Outcome::Redirect => "redirect",
            Outcome::NotModified => "not_modified",
        }
    }
}

#[derive(Debug)]
pub struct Replayed {
    pub outcome: Outcome,
    pub response: Response,
}

/// Fetch both halves of an entry. Either half missing or empty is a miss.
pub async fn lookup(
    store: &PageStore,
    keys: &KeyBuilder<'_>,
    identity: &ResourceIdentity,
) -> Result<CacheEntry, MissReason> {
    let (data_key, meta_key) = keys.build_pair(identity);

    let raw_meta = store
        .get(&meta_key)
        .await
        .filter(|raw| !raw.is_empty())
        .ok_or(MissReason::Absent)?;
    let meta = MetaRecord::decode(&raw_meta).map_err(|err| {
        warn!(key = %meta_key, error = %err, "Discarding undecodable meta entry");
        MissReason::Corrupt
    })?;

    let data = store
        .get(&data_key)
        .await
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| {
            debug!(key = %data_key, "Meta entry present without data");
            MissReason::Incomplete
        })?;

    Ok(CacheEntry { meta, data })
}

/// Build the response for a hit at time `now`.
pub fn replay(
    entry: &CacheEntry,
    ctx: &RequestContext,
    config: &CacheConfig,
    engine: &str,
    now: i64,
) -> Replayed {
    let meta = &entry.meta;

    if let Some(location) = meta.redirect.as_deref() {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::FOUND;
        insert(response.headers_mut(), header::LOCATION, location);
        diagnostic(response.headers_mut(), config, engine);
        return Replayed {
            outcome: Outcome::Redirect,
            response,
        };
    }

    let status = if meta.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };

    if let (Some(since), Some(modified)) = (ctx.if_modified_since, meta.lastmodified)
        && modified <= since
    {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        if let Some(date) = format_http_date(modified) {
            insert(response.headers_mut(), header::LAST_MODIFIED, &date);
        }
        diagnostic(response.headers_mut(), config, engine);
        return Replayed {
            outcome: Outcome::NotModified,
            response,
        };
    }

    let body = if ctx.is_head() {
        Body::empty()
    } else {
        Body::from(entry.data.clone())
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();

    let mime = HeaderValue::from_str(&meta.mime)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME));
    headers.insert(header::CONTENT_TYPE, mime);

    match meta.expire {
        Some(expire) => {
            let max_age = (expire - now).max(0);
            insert(
                headers,
                header::CACHE_CONTROL,
                &format!("public,max-age={max_age},must-revalidate"),
            );
            if let Some(date) = format_http_date(expire) {
                insert(headers, header::EXPIRES, &date);
            }
            insert(headers, header::ETAG, &format!("\"{}\"", etag(&ctx.path, expire)));
        }
        None => {
            insert(headers, header::CACHE_CONTROL, "no-cache,no-store");
            if let Some(date) = format_http_date(now) {
                insert(headers, header::EXPIRES, &date);
            }
        }
    }

    if let Some(date) = meta.lastmodified.and_then(format_http_date) {
        insert(headers, header::LAST_MODIFIED, &date);
    }
    if config.shortlink_header
        && let Some(shortlink) = meta.shortlink.as_deref()
    {
        insert(headers, header::LINK, &format!("<{shortlink}>; rel=shortlink"));
    }
    if config.pingback_header
        && let Some(pingback) = meta.pingback.as_deref()
    {
        insert(headers, PINGBACK_HEADER, pingback);
    }
    diagnostic(headers, config, engine);

    Replayed {
        outcome: Outcome::Serve,
        response,
    }
}

/// Entity tag derived from the path and the absolute expiry.
pub fn etag(path: &str, expire: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(expire.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn diagnostic(headers: &mut HeaderMap, config: &CacheConfig, engine: &str) {
    if config.response_header {
        insert(headers, CACHE_ENGINE_HEADER, &format!("pagegate via {engine}"));
    }
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => debug!(header = %name, "Skipping header with invalid value"),
    }
}
