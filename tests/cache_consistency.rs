//! End-to-end behaviour of the cache middleware in front of an axum router.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use diskcache::cache::{CacheConfig, CacheOrchestrator, CacheState, response_cache_layer};
use futures::future::join_all;
use http_body_util::BodyExt;
use tempfile::tempdir;
use tower::ServiceExt;

fn app(config: CacheConfig, calls: Arc<AtomicUsize>) -> Router {
    let slow_calls = Arc::clone(&calls);
    let private_calls = Arc::clone(&calls);
    let cookie_calls = Arc::clone(&calls);
    let query_calls = calls;

    Router::new()
        .route(
            "/slow",
            get(move || {
                let calls = Arc::clone(&slow_calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    format!("slow v{n}")
                }
            }),
        )
        .route(
            "/private",
            get(move || {
                let calls = Arc::clone(&private_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(header::CACHE_CONTROL, "no-store")], "private").into_response()
                }
            }),
        )
        .route(
            "/login",
            get(move || {
                let calls = Arc::clone(&cookie_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(header::SET_COOKIE, "session=1")], "welcome").into_response()
                }
            }),
        )
        .route(
            "/search",
            get(move |headers: HeaderMap| {
                let calls = Arc::clone(&query_calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    let agent = headers
                        .get(header::USER_AGENT)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    format!("search v{n} for {agent}")
                }
            }),
        )
        .layer(middleware::from_fn_with_state(
            CacheState::new(CacheOrchestrator::new(config)),
            response_cache_layer,
        ))
}

fn request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::HOST, "site.test")
        .body(Body::empty())
        .expect("request should build")
}

async fn body_of(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

fn entries(root: &Path) -> Vec<Vec<u8>> {
    let Ok(dir) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    dir.filter_map(Result::ok)
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| std::fs::read(entry.path()).expect("read entry"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_requests_run_the_route_once() {
    let dir = tempdir().expect("temp cache root");
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(CacheConfig::new(dir.path()), Arc::clone(&calls));

    let responses = join_all((0..10).map(|_| app.clone().oneshot(request("/slow")))).await;
    for response in responses {
        let response = response.expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "slow v1");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(entries(dir.path()).len(), 1);
}

#[tokio::test]
async fn hits_replay_the_first_response() {
    let dir = tempdir().expect("temp cache root");
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(CacheConfig::new(dir.path()), Arc::clone(&calls));

    let first = app.clone().oneshot(request("/slow")).await.expect("first");
    let advertised = first.headers()[header::CACHE_CONTROL]
        .to_str()
        .expect("ascii header")
        .to_string();
    assert!(advertised.starts_with("maxage="), "got {advertised}");
    let first_body = body_of(first).await;

    let second = app.oneshot(request("/slow")).await.expect("second");
    assert_eq!(second.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(body_of(second).await, first_body);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stored = entries(dir.path());
    assert_eq!(stored.len(), 1);
    let text = String::from_utf8_lossy(&stored[0]);
    assert!(text.starts_with("CACHE 200 "));
    assert!(text.ends_with("\r\n\r\nslow v1"));
    assert!(!text.to_ascii_lowercase().contains("cache-control"));
}

#[tokio::test]
async fn uncacheable_responses_are_never_stored() {
    let dir = tempdir().expect("temp cache root");
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(CacheConfig::new(dir.path()), Arc::clone(&calls));

    for uri in ["/private", "/private", "/login", "/login"] {
        let response = app.clone().oneshot(request(uri)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let _ = body_of(response).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(entries(dir.path()).is_empty());
}

#[tokio::test]
async fn key_covers_the_query_but_not_other_headers() {
    let dir = tempdir().expect("temp cache root");
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(CacheConfig::new(dir.path()), Arc::clone(&calls));

    let mut curl = request("/search?q=rust");
    curl.headers_mut()
        .insert(header::USER_AGENT, "curl".parse().expect("header value"));
    let mut browser = request("/search?q=rust");
    browser
        .headers_mut()
        .insert(header::USER_AGENT, "browser".parse().expect("header value"));

    let first = body_of(app.clone().oneshot(curl).await.expect("first")).await;
    let second = body_of(app.clone().oneshot(browser).await.expect("second")).await;
    assert_eq!(first, "search v1 for curl");
    assert_eq!(second, first);

    let other = body_of(
        app.oneshot(request("/search?q=go"))
            .await
            .expect("other query"),
    )
    .await;
    assert_eq!(other, "search v2 for -");
    assert_eq!(entries(dir.path()).len(), 2);
}

#[tokio::test]
async fn bounded_follower_wait_falls_back_to_the_route() {
    let dir = tempdir().expect("temp cache root");
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        populate_wait_timeout: Some(Duration::from_millis(5)),
        ..CacheConfig::new(dir.path())
    };
    let app = app(config, Arc::clone(&calls));

    let (first, second) = tokio::join!(
        app.clone().oneshot(request("/slow")),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            app.clone().oneshot(request("/slow")).await
        }
    );

    assert_eq!(body_of(first.expect("writer")).await, "slow v1");
    assert_eq!(body_of(second.expect("follower")).await, "slow v2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
