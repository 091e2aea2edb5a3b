use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
};
use bytes::Bytes;
use pagegate::cache::{
    CacheConfig, EntryKind, GatewayOptions, KeyBuilder, ManualClock, MemoryBackend, PageCache,
    PageKind, PageSignals, PageStore, ResourceIdentity, SiteConfigs, Viewer, page_cache_layer,
};
use pagegate::util::http_date::format_http_date;
use tower::ServiceExt;

const HOST: &str = "shop.example";

struct Harness {
    app: Router,
    calls: Arc<AtomicUsize>,
    backend: Arc<MemoryBackend>,
    store: PageStore,
    clock: Arc<ManualClock>,
    config: CacheConfig,
}

impl Harness {
    fn new(config: CacheConfig) -> Self {
        Self::with_cache(config, |cache| cache)
    }

    fn with_cache(config: CacheConfig, customize: impl FnOnce(PageCache) -> PageCache) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(MemoryBackend::new(
            NonZeroUsize::new(64).expect("capacity"),
        ));
        let store = PageStore::new(backend.clone());
        let clock = Arc::new(ManualClock::new(1_000));
        let sites = SiteConfigs::new().with_site(HOST, config.clone());
        let cache = customize(
            PageCache::new(GatewayOptions::default(), sites, store.clone())
                .with_clock(clock.clone()),
        );

        let app = Router::new()
            .fallback(storefront)
            .with_state(calls.clone())
            .layer(middleware::from_fn_with_state(cache, page_cache_layer))
            .layer(middleware::from_fn(attach_viewer));

        Self {
            app,
            calls,
            backend,
            store,
            clock,
            config,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond")
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(request(Method::GET, uri)).await
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, HOST)
        .body(Body::empty())
        .expect("request should build")
}

/// Stand-in for the storefront's renderer.
async fn storefront(State(calls): State<Arc<AtomicUsize>>, uri: Uri) -> Response {
    calls.fetch_add(1, Ordering::SeqCst);
    match uri.path() {
        "/old-boots/" => (
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, "https://shop.example/boots/")],
        )
            .into_response(),
        "/missing/" => {
            (StatusCode::NOT_FOUND, Html("<html><body>not here</body></html>")).into_response()
        }
        "/greeting/" => (
            [(header::SET_COOKIE, "seen=1")],
            Html("<html><body>welcome</body></html>"),
        )
            .into_response(),
        "/partial/" => Html("<html><body>half a page").into_response(),
        "/broken/" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "/interrupted/" => {
            let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                Ok(Bytes::from_static(b"<html><body>first half")),
                Err(std::io::Error::other("renderer went away")),
            ];
            (
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                Body::from_stream(futures::stream::iter(chunks)),
            )
                .into_response()
        }
        path => {
            let mut response =
                Html(format!("<html><body>page {path}</body></html>")).into_response();
            response
                .extensions_mut()
                .insert(PageSignals::of_kind(PageKind::Single).last_modified(900));
            response
        }
    }
}

/// Plays the host's authentication layer.
async fn attach_viewer(mut request: Request<Body>, next: Next) -> Response {
    let viewer = match request
        .headers()
        .get("x-test-user")
        .and_then(|value| value.to_str().ok())
    {
        Some("admin") => Some(Viewer::Privileged {
            user: "admin".to_string(),
        }),
        Some(user) => Some(Viewer::Authenticated {
            user: user.to_string(),
        }),
        None => None,
    };
    if let Some(viewer) = viewer {
        request.extensions_mut().insert(viewer);
    }
    next.run(request).await
}

async fn body_of(response: Response) -> Bytes {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect")
}

fn header_of<'r>(response: &'r Response, name: &str) -> Option<&'r str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let harness = Harness::new(CacheConfig::default());

    let first = harness.get("/boots/").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert!(header_of(&first, "x-cache-engine").is_none());
    assert_eq!(body_of(first).await, "<html><body>page /boots/</body></html>");

    let second = harness.get("/boots/").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header_of(&second, "x-cache-engine"), Some("pagegate via memory"));
    assert_eq!(
        header_of(&second, "content-type"),
        Some("text/html; charset=utf-8")
    );
    assert_eq!(body_of(second).await, "<html><body>page /boots/</body></html>");
    assert_eq!(harness.calls(), 1);
}

#[tokio::test]
async fn cache_control_counts_down_to_expiry() {
    let harness = Harness::new(CacheConfig {
        expire_single: 3_600,
        ..Default::default()
    });

    harness.get("/boots/").await;
    harness.clock.set(4_000);

    let hit = harness.get("/boots/").await;
    assert_eq!(
        header_of(&hit, "cache-control"),
        Some("public,max-age=600,must-revalidate")
    );
    assert_eq!(
        header_of(&hit, "expires").map(str::to_string),
        format_http_date(4_600)
    );
    assert!(header_of(&hit, "etag").is_some_and(|tag| tag.starts_with('"')));
    assert_eq!(
        header_of(&hit, "last-modified").map(str::to_string),
        format_http_date(900)
    );
}

#[tokio::test]
async fn zero_ttl_replays_as_uncacheable() {
    let harness = Harness::new(CacheConfig {
        expire_single: 0,
        ..Default::default()
    });

    harness.get("/boots/").await;
    let hit = harness.get("/boots/").await;
    assert_eq!(harness.calls(), 1);
    assert_eq!(header_of(&hit, "cache-control"), Some("no-cache,no-store"));
    assert!(header_of(&hit, "etag").is_none());
}

#[tokio::test]
async fn unchanged_page_answers_not_modified() {
    let harness = Harness::new(CacheConfig::default());
    harness.get("/boots/").await;

    let mut conditional = request(Method::GET, "/boots/");
    let since = format_http_date(1_000).expect("formattable date");
    conditional.headers_mut().insert(
        header::IF_MODIFIED_SINCE,
        HeaderValue::from_str(&since).expect("header value"),
    );
    let response = harness.send(conditional).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(body_of(response).await.is_empty());

    let mut stale = request(Method::GET, "/boots/");
    let since = format_http_date(800).expect("formattable date");
    stale.headers_mut().insert(
        header::IF_MODIFIED_SINCE,
        HeaderValue::from_str(&since).expect("header value"),
    );
    assert_eq!(harness.send(stale).await.status(), StatusCode::OK);
    assert_eq!(harness.calls(), 1);
}

#[tokio::test]
async fn head_hit_has_no_body() {
    let harness = Harness::new(CacheConfig::default());
    harness.get("/boots/").await;

    let response = harness.send(request(Method::HEAD, "/boots/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_of(&response, "x-cache-engine"), Some("pagegate via memory"));
    assert!(body_of(response).await.is_empty());
}

#[tokio::test]
async fn missing_meta_entry_is_a_full_miss() {
    let harness = Harness::new(CacheConfig::default());
    harness.get("/boots/").await;

    let keys = KeyBuilder::new(&harness.config);
    let meta_key = keys.build_key(
        &ResourceIdentity::new("http", HOST, "/boots/"),
        EntryKind::Meta,
    );
    assert!(harness.store.delete(&meta_key).await);

    let response = harness.get("/boots/").await;
    assert!(header_of(&response, "x-cache-engine").is_none());
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn redirects_replay_as_found() {
    let harness = Harness::new(CacheConfig::default());

    let first = harness.get("/old-boots/").await;
    assert_eq!(first.status(), StatusCode::MOVED_PERMANENTLY);

    let second = harness.get("/old-boots/").await;
    assert_eq!(second.status(), StatusCode::FOUND);
    assert_eq!(
        header_of(&second, "location"),
        Some("https://shop.example/boots/")
    );
    assert_eq!(harness.calls(), 1);
}

#[tokio::test]
async fn not_found_pages_replay_with_their_status() {
    let harness = Harness::new(CacheConfig::default());
    harness.get("/missing/").await;

    let hit = harness.get("/missing/").await;
    assert_eq!(hit.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_of(hit).await, "<html><body>not here</body></html>");
    assert_eq!(harness.calls(), 1);
}

#[tokio::test]
async fn uncacheable_responses_are_regenerated() {
    let harness = Harness::new(CacheConfig::default());

    for path in ["/greeting/", "/partial/", "/broken/"] {
        harness.get(path).await;
        harness.get(path).await;
    }
    assert_eq!(harness.calls(), 6);
    assert!(harness.backend.is_empty());
}

#[tokio::test]
async fn bypassed_requests_always_reach_the_storefront() {
    let harness = Harness::new(CacheConfig::default());

    harness.get("/boots/?color=red").await;
    harness.get("/boots/?color=red").await;
    harness.get("/cart/").await;
    harness.get("/cart/").await;
    harness.send(request(Method::POST, "/boots/")).await;
    harness.send(request(Method::POST, "/boots/")).await;
    assert_eq!(harness.calls(), 6);

    let mut elsewhere = request(Method::GET, "/boots/");
    elsewhere
        .headers_mut()
        .insert(header::HOST, HeaderValue::from_static("unknown.example"));
    harness.send(elsewhere).await;
    assert_eq!(harness.calls(), 7);
    assert!(harness.backend.is_empty());
}

#[tokio::test]
async fn query_string_bypasses_a_cached_page() {
    let harness = Harness::new(CacheConfig::default());

    harness.get("/boots/").await;
    let warm = harness.get("/boots/").await;
    assert!(header_of(&warm, "x-cache-engine").is_some());
    assert_eq!(harness.calls(), 1);

    let filtered = harness.get("/boots/?color=red").await;
    assert_eq!(filtered.status(), StatusCode::OK);
    assert!(header_of(&filtered, "x-cache-engine").is_none());
    assert_eq!(harness.calls(), 2);

    let plain = harness.get("/boots/").await;
    assert!(header_of(&plain, "x-cache-engine").is_some());
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn interrupted_body_passes_through_without_a_gateway_error() {
    let harness = Harness::new(CacheConfig::default());

    let response = harness.get("/interrupted/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_of(&response, "content-type"),
        Some("text/html; charset=utf-8")
    );
    assert!(body_of(response).await.is_empty());
    assert!(harness.backend.is_empty());

    harness.get("/interrupted/").await;
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn logged_in_cookie_bypasses_the_cache() {
    let harness = Harness::new(CacheConfig::default());
    harness.get("/boots/").await;

    let mut logged_in = request(Method::GET, "/boots/");
    logged_in.headers_mut().insert(
        header::COOKIE,
        HeaderValue::from_static("storefront_logged_in_abc=alice"),
    );
    let response = harness.send(logged_in).await;
    assert!(header_of(&response, "x-cache-engine").is_none());
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn privileged_viewer_is_marked_and_never_stored() {
    let harness = Harness::new(CacheConfig {
        cache_logged_in: true,
        ..Default::default()
    });

    let mut privileged = request(Method::GET, "/boots/");
    privileged
        .headers_mut()
        .insert("x-test-user", HeaderValue::from_static("admin"));
    let response = harness.send(privileged).await;
    let cookie = header_of(&response, "set-cookie").expect("marker cookie");
    assert!(cookie.starts_with("pagegate-nocache=1"));
    assert!(cookie.contains("Max-Age=86400"));
    assert!(harness.backend.is_empty());

    let mut marked = request(Method::GET, "/boots/");
    marked
        .headers_mut()
        .insert(header::COOKIE, HeaderValue::from_static("pagegate-nocache=1"));
    harness.send(marked).await;
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn per_user_keys_separate_logged_in_viewers() {
    let harness = Harness::new(CacheConfig {
        cache_logged_in: true,
        key_template: "$scheme://$host$request_uri#$remote_user".to_string(),
        ..Default::default()
    });

    for user in ["alice", "bob", "alice"] {
        let mut req = request(Method::GET, "/account-summary/");
        req.headers_mut()
            .insert("x-test-user", HeaderValue::from_str(user).expect("header value"));
        harness.send(req).await;
    }
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn offline_backend_serves_uncached_pages() {
    let harness = Harness::new(CacheConfig::default());
    harness.get("/boots/").await;
    harness.backend.set_alive(false);

    let response = harness.get("/boots/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header_of(&response, "x-cache-engine").is_none());
    assert_eq!(harness.calls(), 2);
}

#[tokio::test]
async fn body_transform_only_touches_stored_bytes() {
    let harness = Harness::with_cache(CacheConfig::default(), |cache| {
        cache.with_body_transform(Arc::new(|_: PageKind, body: Bytes| {
            Bytes::from(String::from_utf8_lossy(&body).replace("page", "PAGE"))
        }))
    });

    let generated = harness.get("/boots/").await;
    assert_eq!(body_of(generated).await, "<html><body>page /boots/</body></html>");

    let replayed = harness.get("/boots/").await;
    assert_eq!(body_of(replayed).await, "<html><body>PAGE /boots/</body></html>");
}

#[tokio::test]
async fn suppressed_page_types_are_not_stored() {
    let harness = Harness::new(CacheConfig {
        nocache_single: true,
        ..Default::default()
    });

    harness.get("/boots/").await;
    harness.get("/boots/").await;
    assert_eq!(harness.calls(), 2);
    assert!(harness.backend.is_empty());
}
