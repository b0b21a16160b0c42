//! Disk-backed HTTP response cache.
//!
//! Responses are persisted under a cache root, one file per request key, and
//! served from disk until the per-status validity runs out:
//!
//! - [`keys`] turns a request into a key and a collision fingerprint;
//! - [`store`] owns the entry file format, staged writes and validated reads;
//! - [`registry`] coordinates readers and the single populating writer per key;
//! - [`capture`] tees a handler's output into the client and a staged entry;
//! - [`orchestrator`] runs the per-request read / populate / fallback cycle;
//! - [`middleware`] puts all of it in front of an axum route.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! directory = "cache"
//! key_parts = ["method", "scheme", "host", "path", "query"]
//! use_stale = false
//!
//! [cache.validity]
//! 200 = 604800
//! 404 = 60
//! ```

pub mod capture;
mod config;
pub mod keys;
mod lock;
mod middleware;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod sink;
pub mod store;

pub use capture::ResponseCapture;
pub use config::CacheConfig;
pub use keys::{CacheKey, Fingerprint, KeyMask, KeyMaskError, KeyRequest, compute_key};
pub use middleware::{CacheState, response_cache_layer};
pub use orchestrator::{CacheOrchestrator, ServeOutcome};
pub use policy::{BypassReason, Cacheability, FreshnessPolicy};
pub use registry::{KeyLockHandle, KeyLockRegistry, PopulateOutcome, Role};
pub use sink::{
    BufferedWriter, DiscardWriter, Handler, HandlerError, PendingResponse, ResponseWriter,
    StreamingWriter, streaming_channel,
};
pub use store::{CacheStore, EntryWriter, StoreError, StoredEntry};

pub(crate) const METRIC_HIT_TOTAL: &str = "diskcache_hit_total";
pub(crate) const METRIC_STALE_HIT_TOTAL: &str = "diskcache_stale_hit_total";
pub(crate) const METRIC_MISS_TOTAL: &str = "diskcache_miss_total";
pub(crate) const METRIC_POPULATE_TOTAL: &str = "diskcache_populate_total";
pub(crate) const METRIC_POPULATE_FAILED_TOTAL: &str = "diskcache_populate_failed_total";
pub(crate) const METRIC_COLLISION_TOTAL: &str = "diskcache_collision_total";
pub(crate) const METRIC_FALLBACK_TOTAL: &str = "diskcache_fallback_total";
pub(crate) const METRIC_EXHAUSTED_TOTAL: &str = "diskcache_exhausted_total";
pub(crate) const METRIC_STORE_ERROR_TOTAL: &str = "diskcache_store_error_total";
pub(crate) const METRIC_LOCK_RECORDS: &str = "diskcache_lock_records";
pub(crate) const METRIC_POPULATE_MS: &str = "diskcache_populate_ms";
