mod middleware;

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, middleware as axum_middleware};
use tokio::{net::TcpListener, sync::Notify};
use tracing::{error, info, warn};

use crate::cache::{CacheState, response_cache_layer};
use crate::infra::files::{FileRoot, serve_file};

use super::error::InfraError;

pub use middleware::log_responses;

const SOURCE: &str = "infra::http";

/// Router serving the file root through the response cache.
pub fn build_router(cache: CacheState, files: FileRoot) -> Router {
    Router::new()
        .fallback(serve_file)
        .with_state(files)
        .layer(axum_middleware::from_fn_with_state(
            cache,
            response_cache_layer,
        ))
        .layer(axum_middleware::from_fn(log_responses))
}

/// Bind `addr` and serve until Ctrl-C, then drain for at most `graceful`.
pub async fn serve(addr: SocketAddr, router: Router, graceful: Duration) -> Result<(), InfraError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| InfraError::Bind { addr, source })?;
    info!(target = SOURCE, addr = %addr, "Listening");

    serve_until(listener, router, graceful, ctrl_c()).await
}

/// Serve on an already bound listener until `signal` resolves.
///
/// In-flight requests get `graceful` to finish; the server stops regardless afterwards.
pub async fn serve_until<F>(
    listener: TcpListener,
    router: Router,
    graceful: Duration,
    signal: F,
) -> Result<(), InfraError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let triggered = Arc::new(Notify::new());
    let notify = Arc::clone(&triggered);

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            signal.await;
            info!(target = SOURCE, "Shutdown requested");
            notify.notify_one();
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result.map_err(|err| InfraError::server(err.to_string())),
        _ = async {
            triggered.notified().await;
            tokio::time::sleep(graceful).await;
        } => {
            warn!(
                target = SOURCE,
                timeout_secs = graceful.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = SOURCE, error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::cache::{CacheConfig, CacheOrchestrator};

    #[tokio::test]
    async fn files_are_served_through_the_cache() {
        let files = tempdir().unwrap();
        let cache = tempdir().unwrap();
        std::fs::write(files.path().join("hello.txt"), "hello").unwrap();

        let router = build_router(
            CacheState::new(CacheOrchestrator::new(CacheConfig::new(cache.path()))),
            FileRoot::new(files.path()),
        );

        let request = Request::builder()
            .uri("/hello.txt")
            .header("host", "files.test")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");
        assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 1);

        let missing = Request::builder()
            .uri("/nope.txt")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serve_until_stops_on_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = Router::new();

        serve_until(listener, router, Duration::from_secs(1), async {})
            .await
            .unwrap();
    }
}
