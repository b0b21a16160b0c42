//! Per-request cache cycle.
//!
//! ```text
//! read ──hit──────────────────────────────▶ Hit
//!   │ ──expired + use_stale + readable─────▶ StaleHit (+ background refresh)
//!   │ ──collision / io error──────────────▶ Fallback
//!   └─miss─▶ try_become_writer
//!              ├─ writer ─────────────────▶ Populated
//!              ├─ follower, completed ─────▶ read again (once)
//!              └─ follower, failed/timeout ▶ Fallback
//! ```

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderValue, StatusCode, header, request::Parts};
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::io::AsyncBufReadExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::capture::ResponseCapture;
use super::config::CacheConfig;
use super::keys::{CacheKey, Fingerprint, KeyRequest, compute_key};
use super::registry::{KeyLockRegistry, PopulateOutcome, Role};
use super::sink::{DiscardWriter, Handler, ResponseWriter};
use super::store::{CacheStore, StoreError, StoredEntry};
use super::{
    METRIC_COLLISION_TOTAL, METRIC_EXHAUSTED_TOTAL, METRIC_FALLBACK_TOTAL, METRIC_HIT_TOTAL,
    METRIC_MISS_TOTAL, METRIC_POPULATE_FAILED_TOTAL, METRIC_POPULATE_MS, METRIC_POPULATE_TOTAL,
    METRIC_STALE_HIT_TOTAL, METRIC_STORE_ERROR_TOTAL,
};

const SOURCE: &str = "cache::orchestrator";

/// Follower waits allowed per request before giving up with a 500.
const MAX_FOLLOWER_WAITS: u8 = 1;

const INTERNAL_ERROR_BODY: &[u8] = b"internal server error\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    Hit,
    StaleHit,
    Populated,
    Fallback,
    Exhausted,
    Bypassed,
}

impl ServeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::StaleHit => "stale_hit",
            Self::Populated => "populated",
            Self::Fallback => "fallback",
            Self::Exhausted => "exhausted",
            Self::Bypassed => "bypassed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheOrchestrator {
    store: Arc<CacheStore>,
    registry: Arc<KeyLockRegistry>,
    config: Arc<CacheConfig>,
    reclaimer: Option<Arc<Reclaimer>>,
}

/// Idle-record reclaimer owned by an orchestrator; aborted with its last clone.
#[derive(Debug)]
struct Reclaimer(JoinHandle<()>);

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl CacheOrchestrator {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_registry(config, Arc::new(KeyLockRegistry::new()))
    }

    /// Build an orchestrator coordinating through an existing registry.
    ///
    /// Inside a tokio runtime this also starts reclaiming idle lock records
    /// every `reclaim_interval`; the task stops when the last clone is dropped.
    pub fn with_registry(config: CacheConfig, registry: Arc<KeyLockRegistry>) -> Self {
        let reclaimer = spawn_reclaimer(&config, &registry);
        Self {
            store: Arc::new(CacheStore::new(config.root.clone())),
            registry,
            config: Arc::new(config),
            reclaimer,
        }
    }

    /// Whether idle lock records are reclaimed in the background.
    pub fn is_reclaiming(&self) -> bool {
        self.reclaimer.is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<KeyLockRegistry> {
        &self.registry
    }

    /// Answer one request from the cache, populating it through `handler`
    /// when needed. Only retry exhaustion surfaces to the client as an error
    /// of the cache's own making.
    pub async fn serve(
        &self,
        request: &Parts,
        handler: Arc<dyn Handler>,
        writer: &mut dyn ResponseWriter,
    ) -> ServeOutcome {
        if !self.config.enabled {
            run_direct(&*handler, request, writer).await;
            return ServeOutcome::Bypassed;
        }

        let (key, fingerprint) =
            compute_key(self.config.key_mask, &KeyRequest::from_parts(request));
        let mut handle = self.registry.acquire(&key).await;
        let mut follower_waits = 0_u8;

        loop {
            match self
                .store
                .read(&key, fingerprint, &self.config.freshness)
                .await
            {
                Ok(entry) => {
                    counter!(METRIC_HIT_TOTAL).increment(1);
                    deliver(&key, entry, writer).await;
                    return ServeOutcome::Hit;
                }
                Err(StoreError::Expired) => {
                    if self.config.use_stale
                        && let Ok(entry) = self.store.read_stale(&key, fingerprint).await
                    {
                        counter!(METRIC_STALE_HIT_TOTAL).increment(1);
                        deliver(&key, entry, writer).await;
                        handle.release();
                        self.spawn_refresh(key, fingerprint, request.clone(), handler);
                        return ServeOutcome::StaleHit;
                    }
                    debug!(target = SOURCE, key = %key, "Cache entry expired");
                }
                Err(StoreError::InvalidEntry { reason }) => {
                    debug!(target = SOURCE, key = %key, reason, "Cache miss");
                }
                Err(err) => {
                    if matches!(err, StoreError::KeyCollision { .. }) {
                        counter!(METRIC_COLLISION_TOTAL).increment(1);
                        warn!(
                            target = SOURCE,
                            op = "read",
                            key = %key,
                            kind = err.kind(),
                            error = %err,
                            "Cache key collision; serving uncached"
                        );
                    } else {
                        counter!(METRIC_STORE_ERROR_TOTAL, "kind" => err.kind()).increment(1);
                        warn!(
                            target = SOURCE,
                            op = "read",
                            key = %key,
                            kind = err.kind(),
                            error = %err,
                            "Cache read failed; serving uncached"
                        );
                    }
                    handle.release();
                    return self.fallback(&*handler, request, writer).await;
                }
            }

            counter!(METRIC_MISS_TOTAL).increment(1);

            let key_ref = &key;
            let handler_ref = &*handler;
            let populate_writer: &mut dyn ResponseWriter = &mut *writer;
            let role = handle
                .try_become_writer(self.config.populate_wait_timeout, move || {
                    self.populate(key_ref, fingerprint, request, handler_ref, populate_writer)
                })
                .await;

            match role {
                Role::Writer(outcome) => {
                    handle.release();
                    if outcome == PopulateOutcome::Failed && writer.status().is_none() {
                        write_internal_error(writer).await;
                    }
                    return ServeOutcome::Populated;
                }
                Role::Follower(PopulateOutcome::Completed) => {
                    follower_waits += 1;
                    if follower_waits > MAX_FOLLOWER_WAITS {
                        handle.release();
                        counter!(METRIC_EXHAUSTED_TOTAL).increment(1);
                        error!(
                            target = SOURCE,
                            key = %key,
                            waits = follower_waits,
                            result = "exhausted",
                            "Cache entry still missing after waiting on populate"
                        );
                        write_internal_error(writer).await;
                        return ServeOutcome::Exhausted;
                    }
                }
                Role::Follower(outcome) => {
                    handle.release();
                    debug!(
                        target = SOURCE,
                        key = %key,
                        outcome = outcome.as_str(),
                        "Populate did not complete; serving uncached"
                    );
                    return self.fallback(&*handler, request, writer).await;
                }
            }
        }
    }

    async fn populate(
        &self,
        key: &CacheKey,
        fingerprint: Fingerprint,
        request: &Parts,
        handler: &dyn Handler,
        writer: &mut dyn ResponseWriter,
    ) -> PopulateOutcome {
        counter!(METRIC_POPULATE_TOTAL).increment(1);
        let started = Instant::now();

        let mut capture =
            ResponseCapture::new(writer, &self.store, &self.config.freshness, key, fingerprint);
        let result = AssertUnwindSafe(handler.serve(request, &mut capture))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(())) => {
                let stored = capture.finish().await;
                debug!(target = SOURCE, op = "populate", key = %key, stored, "Populate completed");
                PopulateOutcome::Completed
            }
            Ok(Err(err)) => {
                capture.abandon();
                warn!(
                    target = SOURCE,
                    op = "populate",
                    key = %key,
                    error = %err,
                    "Handler failed while populating cache entry"
                );
                PopulateOutcome::Failed
            }
            Err(panic) => {
                capture.abandon();
                error!(
                    target = SOURCE,
                    op = "populate",
                    key = %key,
                    panic = panic_message(&*panic),
                    "Handler panicked while populating cache entry"
                );
                PopulateOutcome::Failed
            }
        };

        histogram!(METRIC_POPULATE_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        if outcome == PopulateOutcome::Failed {
            counter!(METRIC_POPULATE_FAILED_TOTAL).increment(1);
        }
        outcome
    }

    async fn fallback(
        &self,
        handler: &dyn Handler,
        request: &Parts,
        writer: &mut dyn ResponseWriter,
    ) -> ServeOutcome {
        counter!(METRIC_FALLBACK_TOTAL).increment(1);
        run_direct(handler, request, writer).await;
        ServeOutcome::Fallback
    }

    fn spawn_refresh(
        &self,
        key: CacheKey,
        fingerprint: Fingerprint,
        request: Parts,
        handler: Arc<dyn Handler>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut handle = this.registry.acquire(&key).await;
            if this
                .store
                .read(&key, fingerprint, &this.config.freshness)
                .await
                .is_ok()
            {
                return;
            }

            let mut sink = DiscardWriter::new();
            let this_ref = &this;
            let key_ref = &key;
            let request_ref = &request;
            let handler_ref = &*handler;
            let sink_ref: &mut dyn ResponseWriter = &mut sink;
            let role = handle
                .try_become_writer(None, move || {
                    this_ref.populate(key_ref, fingerprint, request_ref, handler_ref, sink_ref)
                })
                .await;

            debug!(
                target = SOURCE,
                op = "refresh",
                key = %key,
                role = ?role,
                bytes = sink.body_bytes(),
                "Background refresh finished"
            );
        });
    }
}

fn spawn_reclaimer(
    config: &CacheConfig,
    registry: &Arc<KeyLockRegistry>,
) -> Option<Arc<Reclaimer>> {
    if config.reclaim_interval.is_zero() {
        warn!(
            target = SOURCE,
            op = "reclaim",
            "Zero reclaim interval; idle lock records are kept"
        );
        return None;
    }
    if Handle::try_current().is_err() {
        debug!(
            target = SOURCE,
            op = "reclaim",
            "No tokio runtime; idle lock records are kept"
        );
        return None;
    }

    let handle = registry.spawn_reclaimer(config.reclaim_interval, config.reclaim_grace);
    Some(Arc::new(Reclaimer(handle)))
}

/// Run the handler straight against the client, turning an error or panic
/// before any status into a 500.
async fn run_direct(handler: &dyn Handler, request: &Parts, writer: &mut dyn ResponseWriter) {
    let result = AssertUnwindSafe(handler.serve(request, &mut *writer))
        .catch_unwind()
        .await;

    let failed = match result {
        Ok(Ok(())) => false,
        Ok(Err(err)) => {
            warn!(target = SOURCE, op = "direct", error = %err, "Handler failed");
            true
        }
        Err(panic) => {
            error!(
                target = SOURCE,
                op = "direct",
                panic = panic_message(&*panic),
                "Handler panicked"
            );
            true
        }
    };

    if failed && writer.status().is_none() {
        write_internal_error(writer).await;
    }
}

async fn deliver(key: &CacheKey, entry: StoredEntry, writer: &mut dyn ResponseWriter) {
    if let Err(err) = stream_entry(entry, writer).await {
        debug!(
            target = SOURCE,
            op = "deliver",
            key = %key,
            error = %err,
            "Failed to deliver cached entry"
        );
    }
}

/// Copy a stored entry to the client, replacing any headers of the same name.
async fn stream_entry(entry: StoredEntry, writer: &mut dyn ResponseWriter) -> io::Result<()> {
    let StoredEntry {
        status,
        headers,
        mut body,
        ..
    } = entry;

    writer.headers_mut().extend(headers);
    writer.write_status(status).await?;

    loop {
        let chunk = body.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len();
        writer.write_body(chunk).await?;
        body.consume(len);
    }
}

async fn write_internal_error(writer: &mut dyn ResponseWriter) {
    let headers = writer.headers_mut();
    headers.clear();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    if let Err(err) = writer.write_status(StatusCode::INTERNAL_SERVER_ERROR).await {
        debug!(target = SOURCE, error = %err, "Client gone before error response");
        return;
    }
    if let Err(err) = writer.write_body(INTERNAL_ERROR_BODY).await {
        debug!(target = SOURCE, error = %err, "Client gone before error response");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
