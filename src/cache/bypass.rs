//! Cacheability rules.
//!
//! Rules run in a fixed order and the first match wins; the reason label is
//! what shows up in logs and in `pagegate_bypass_total{reason}`.

use axum::http::Method;
use once_cell::sync::Lazy;
use regex::Regex;

use super::config::GatewayOptions;
use super::context::RequestContext;

/// Storefront pages that are always per-visitor.
static DYNAMIC_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^/(?:checkout|cart|basket|my-account|account|login|logout|register|wishlist|admin|api)(?:/|$)",
    )
    .expect("dynamic page pattern is valid")
});

const SESSION_QUERY_KEYS: [&str; 2] = ["SID", "sid"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BypassReason {
    Unavailable,
    Method,
    SessionMarker,
    NoSiteConfig,
    QueryString,
    DynamicPage,
    NoCacheMarker,
    LoggedIn,
    ExcludedCookie,
    ExcludedUrl,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Unavailable => "unavailable",
            BypassReason::Method => "method",
            BypassReason::SessionMarker => "session_marker",
            BypassReason::NoSiteConfig => "no_site_config",
            BypassReason::QueryString => "query_string",
            BypassReason::DynamicPage => "dynamic_page",
            BypassReason::NoCacheMarker => "nocache_marker",
            BypassReason::LoggedIn => "logged_in",
            BypassReason::ExcludedCookie => "excluded_cookie",
            BypassReason::ExcludedUrl => "excluded_url",
        }
    }
}

/// Decide whether the request must skip the cache entirely.
///
/// `None` means the request is eligible for lookup and capture.
pub fn evaluate(
    ctx: &RequestContext,
    options: &GatewayOptions,
    backend_alive: bool,
) -> Option<BypassReason> {
    if !options.enabled || !backend_alive {
        return Some(BypassReason::Unavailable);
    }
    if ctx.method != Method::GET && ctx.method != Method::HEAD {
        return Some(BypassReason::Method);
    }
    if ctx.query.as_deref().is_some_and(has_session_marker) {
        return Some(BypassReason::SessionMarker);
    }
    let Some(config) = ctx.config.as_deref() else {
        return Some(BypassReason::NoSiteConfig);
    };
    if ctx.query.is_some() {
        return Some(BypassReason::QueryString);
    }
    if DYNAMIC_PATH.is_match(&ctx.path) {
        return Some(BypassReason::DynamicPage);
    }
    if ctx.cookie(&options.nocache_cookie).is_some() {
        return Some(BypassReason::NoCacheMarker);
    }
    if !config.cache_logged_in
        && (ctx.has_cookie_prefix(&config.logged_in_cookie_prefix) || !ctx.viewer.is_anonymous())
    {
        return Some(BypassReason::LoggedIn);
    }
    if config
        .nocache_cookies
        .iter()
        .any(|prefix| ctx.has_cookie_prefix(prefix))
    {
        return Some(BypassReason::ExcludedCookie);
    }
    if config
        .nocache_url
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(&ctx.path))
    {
        return Some(BypassReason::ExcludedUrl);
    }
    None
}

fn has_session_marker(query: &str) -> bool {
    query.split('&').any(|pair| {
        let name = pair.split_once('=').map_or(pair, |(name, _)| name);
        SESSION_QUERY_KEYS.contains(&name)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum_extra::extract::cookie::{Cookie, CookieJar};
    use regex::Regex;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::context::Viewer;

    fn ctx(path: &str) -> RequestContext {
        RequestContext {
            method: Method::GET,
            scheme: "http".into(),
            host: "shop.example".into(),
            path: path.into(),
            query: None,
            cookies: CookieJar::new(),
            viewer: Viewer::Anonymous,
            if_modified_since: None,
            config: Some(Arc::new(CacheConfig::default())),
        }
    }

    fn eval(ctx: &RequestContext) -> Option<BypassReason> {
        evaluate(ctx, &GatewayOptions::default(), true)
    }

    #[test]
    fn plain_anonymous_get_is_cacheable() {
        assert_eq!(eval(&ctx("/shoes/red/")), None);
    }

    #[test]
    fn unavailable_wins_over_everything() {
        let mut request = ctx("/cart/");
        request.method = Method::POST;
        assert_eq!(
            evaluate(&request, &GatewayOptions::default(), false),
            Some(BypassReason::Unavailable)
        );
        let disabled = GatewayOptions {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(evaluate(&ctx("/"), &disabled, true), Some(BypassReason::Unavailable));
    }

    #[test]
    fn rule_order_is_respected() {
        let mut request = ctx("/cart/");
        request.method = Method::POST;
        assert_eq!(eval(&request), Some(BypassReason::Method));

        request.method = Method::HEAD;
        request.query = Some("sid=9".into());
        request.config = None;
        assert_eq!(eval(&request), Some(BypassReason::SessionMarker));

        request.query = Some("page=2".into());
        assert_eq!(eval(&request), Some(BypassReason::NoSiteConfig));

        request.config = Some(Arc::new(CacheConfig::default()));
        assert_eq!(eval(&request), Some(BypassReason::QueryString));

        request.query = None;
        assert_eq!(eval(&request), Some(BypassReason::DynamicPage));
    }

    #[test]
    fn session_marker_requires_exact_name() {
        assert!(has_session_marker("a=1&SID=abc"));
        assert!(has_session_marker("sid"));
        assert!(!has_session_marker("side=1&sidebar=0"));
    }

    #[test]
    fn dynamic_paths() {
        for path in ["/checkout", "/cart/", "/my-account/orders/", "/API/v1"] {
            assert_eq!(eval(&ctx(path)), Some(BypassReason::DynamicPage), "{path}");
        }
        for path in ["/cartography/", "/blog/login-tips/", "/"] {
            assert_eq!(eval(&ctx(path)), None, "{path}");
        }
    }

    #[test]
    fn cookies_drive_marker_logged_in_and_exclusions() {
        let mut request = ctx("/");
        request.cookies = CookieJar::new().add(Cookie::new("pagegate-nocache", "1"));
        assert_eq!(eval(&request), Some(BypassReason::NoCacheMarker));

        request.cookies = CookieJar::new().add(Cookie::new("storefront_logged_in_abc", "ada"));
        assert_eq!(eval(&request), Some(BypassReason::LoggedIn));

        request.config = Some(Arc::new(CacheConfig {
            cache_logged_in: true,
            nocache_cookies: vec!["storefront_logged".into()],
            ..Default::default()
        }));
        assert_eq!(eval(&request), Some(BypassReason::ExcludedCookie));
    }

    #[test]
    fn authenticated_viewer_counts_as_logged_in() {
        let mut request = ctx("/");
        request.viewer = Viewer::Authenticated { user: "ada".into() };
        assert_eq!(eval(&request), Some(BypassReason::LoggedIn));

        request.config = Some(Arc::new(CacheConfig {
            cache_logged_in: true,
            ..Default::default()
        }));
        assert_eq!(eval(&request), None);
    }

    #[test]
    fn exclusion_regex_is_last() {
        let mut request = ctx("/sale/today/");
        request.config = Some(Arc::new(CacheConfig {
            nocache_url: Some(Regex::new(r"^/sale/").expect("regex")),
            ..Default::default()
        }));
        assert_eq!(eval(&request), Some(BypassReason::ExcludedUrl));
    }
}
