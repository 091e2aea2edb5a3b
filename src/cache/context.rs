//! Per-request view of everything the gateway decides on.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, header};
use axum_extra::extract::cookie::CookieJar;

use crate::util::http_date::parse_http_date;

use super::config::{CacheConfig, GatewayOptions, SiteConfigs};
use super::keys::ResourceIdentity;

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Who is looking at the page. Inserted as a request extension by the host's
/// authentication layer; absent means anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Viewer {
    #[default]
    Anonymous,
    Authenticated { user: String },
    /// May edit content; pages generated for them are never stored.
    Privileged { user: String },
}

impl Viewer {
    pub fn user(&self) -> Option<&str> {
        match self {
            Viewer::Anonymous => None,
            Viewer::Authenticated { user } | Viewer::Privileged { user } => Some(user),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Viewer::Anonymous)
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, Viewer::Privileged { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub cookies: CookieJar,
    pub viewer: Viewer,
    pub if_modified_since: Option<i64>,
    /// Configuration for the request host, if any.
    pub config: Option<Arc<CacheConfig>>,
}

impl RequestContext {
    pub fn from_request(
        request: &Request<Body>,
        options: &GatewayOptions,
        sites: &SiteConfigs,
    ) -> Self {
        let headers = request.headers();
        let uri = request.uri();

        let scheme = forwarded_proto(headers)
            .or_else(|| uri.scheme_str().map(str::to_ascii_lowercase))
            .unwrap_or_else(|| options.default_scheme.clone());
        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|authority| authority.to_string()))
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config = sites.for_host(&host);
        let if_modified_since = headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date);

        Self {
            method: request.method().clone(),
            scheme,
            host,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            cookies: CookieJar::from_headers(headers),
            viewer: request.extensions().get::<Viewer>().cloned().unwrap_or_default(),
            if_modified_since,
            config,
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|cookie| cookie.value())
    }

    pub fn has_cookie_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.cookies.iter().any(|cookie| cookie.name().starts_with(prefix))
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    /// The identity the key template is filled from.
    pub fn identity(&self) -> ResourceIdentity {
        let request_uri = match &self.query {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        };
        let session = self
            .config
            .as_deref()
            .and_then(|config| self.cookie(&config.session_cookie))
            .unwrap_or_default()
            .to_string();
        ResourceIdentity::new(&self.scheme, &self.host, request_uri)
            .with_user(self.viewer.user().unwrap_or_default())
            .with_session(session)
    }
}

fn forwarded_proto(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(FORWARDED_PROTO)?.to_str().ok()?;
    let first = value.split(',').next()?.trim().to_ascii_lowercase();
    matches!(first.as_str(), "http" | "https").then_some(first)
}
