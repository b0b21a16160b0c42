//! Response cache middleware.
//!
//! Runs the downstream route through a [`CacheOrchestrator`]. The route is
//! wrapped as a one-shot [`Handler`] that replays its axum response into the
//! cache's writer; the orchestrator runs on its own task so a disconnecting
//! client never cancels a populate other requests are waiting on.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{Request, request::Parts},
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;
use tracing::{Instrument, Span, debug, instrument};

use super::lock::mutex_lock;
use super::orchestrator::CacheOrchestrator;
use super::sink::{Handler, HandlerError, ResponseWriter, streaming_channel};

const SOURCE: &str = "cache::middleware";
const STREAM_CAPACITY: usize = 16;

/// Shared cache state for middleware.
#[derive(Debug, Clone)]
pub struct CacheState {
    pub orchestrator: CacheOrchestrator,
}

impl CacheState {
    pub fn new(orchestrator: CacheOrchestrator) -> Self {
        Self { orchestrator }
    }
}

/// Middleware serving cacheable requests through the disk cache.
///
/// Requests whose method is not configured as cacheable, and every request
/// while the cache is disabled, go straight to the route.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let config = cache.orchestrator.config();
    if !config.enabled || !config.caches_method(request.method()) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let handler = Arc::new(NextHandler::new(next, body));
    let (mut writer, pending) = streaming_channel(STREAM_CAPACITY);
    let orchestrator = cache.orchestrator.clone();

    tokio::spawn(
        async move {
            let outcome = orchestrator.serve(&parts, handler, &mut writer).await;
            writer.finish().await;
            debug!(target = SOURCE, outcome = outcome.as_str(), "Request served");
        }
        .instrument(Span::current()),
    );

    pending.into_response().await
}

/// The rest of the middleware stack, callable once.
struct NextHandler {
    pending: Mutex<Option<(Next, Body)>>,
}

impl NextHandler {
    fn new(next: Next, body: Body) -> Self {
        Self {
            pending: Mutex::new(Some((next, body))),
        }
    }
}

#[async_trait]
impl Handler for NextHandler {
    async fn serve(
        &self,
        request: &Parts,
        writer: &mut dyn ResponseWriter,
    ) -> Result<(), HandlerError> {
        let taken = mutex_lock(&self.pending, SOURCE, "take_next").take();
        let Some((next, body)) = taken else {
            return Err(io::Error::other("downstream route already invoked").into());
        };

        let response = next.run(Request::from_parts(request.clone(), body)).await;
        let (head, mut body) = response.into_parts();

        writer.headers_mut().extend(head.headers);
        writer.write_status(head.status).await?;

        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame?.into_data() {
                writer.write_body(&data).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Router, http::StatusCode, middleware, routing::get};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::CacheConfig;

    fn app(config: CacheConfig, hits: Arc<AtomicUsize>) -> Router {
        let state = CacheState::new(CacheOrchestrator::new(config));
        Router::new()
            .route(
                "/count",
                get(move || {
                    let hits = Arc::clone(&hits);
                    async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                        format!("call {n}")
                    }
                })
                .post(|| async { "posted" }),
            )
            .layer(middleware::from_fn_with_state(state, response_cache_layer))
    }

    async fn body_of(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("host", "cache.test")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn get_is_cached() {
        let dir = tempdir().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(CacheConfig::new(dir.path()), Arc::clone(&hits));

        let first = app.clone().oneshot(get_request("/count")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(
            first.headers()["cache-control"]
                .to_str()
                .unwrap()
                .starts_with("maxage=")
        );
        assert_eq!(body_of(first).await, "call 1");

        let second = app.oneshot(get_request("/count")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_of(second).await, "call 1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_methods_pass_through() {
        let dir = tempdir().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let app = app(CacheConfig::new(dir.path()), hits);

        let request = Request::builder()
            .method("POST")
            .uri("/count")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.headers().get("cache-control").is_none());
        assert_eq!(body_of(response).await, "posted");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn disabled_cache_passes_through() {
        let dir = tempdir().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::new(dir.path())
        };
        let app = app(config, Arc::clone(&hits));

        app.clone().oneshot(get_request("/count")).await.unwrap();
        let response = app.oneshot(get_request("/count")).await.unwrap();
        assert_eq!(body_of(response).await, "call 2");
    }

    #[tokio::test]
    async fn next_handler_runs_once() {
        let probe = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn(
                |request: Request<Body>, next: Next| async move {
                    let (parts, body) = request.into_parts();
                    let handler = NextHandler::new(next, body);
                    let mut first = crate::cache::BufferedWriter::new();
                    handler.serve(&parts, &mut first).await.unwrap();
                    let mut second = crate::cache::BufferedWriter::new();
                    let err = handler.serve(&parts, &mut second).await.unwrap_err();
                    assert!(err.to_string().contains("already invoked"));
                    first.into_response()
                },
            ));
        let response = probe.oneshot(get_request("/")).await.unwrap();
        assert_eq!(body_of(response).await, "ok");
    }
}
