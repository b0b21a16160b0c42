//! Runtime cache configuration.
//!
//! Built from the `[cache]` settings section; tests construct it directly.

use std::path::PathBuf;
use std::time::Duration;

use axum::http::Method;

use super::keys::KeyMask;
use super::policy::FreshnessPolicy;

const DEFAULT_DIRECTORY: &str = "cache";
const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_RECLAIM_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false every request goes straight to the handler.
    pub enabled: bool,
    /// Directory holding entry files and staging files.
    pub root: PathBuf,
    pub key_mask: KeyMask,
    pub freshness: FreshnessPolicy,
    /// Serve an expired entry while a background task refreshes it.
    pub use_stale: bool,
    /// Upper bound on how long a follower waits for the populating writer.
    pub populate_wait_timeout: Option<Duration>,
    pub reclaim_interval: Duration,
    pub reclaim_grace: Duration,
    /// Methods the HTTP adapter routes through the cache.
    pub methods: Vec<Method>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from(DEFAULT_DIRECTORY),
            key_mask: KeyMask::default(),
            freshness: FreshnessPolicy::default(),
            use_stale: false,
            populate_wait_timeout: None,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            reclaim_grace: DEFAULT_RECLAIM_GRACE,
            methods: vec![Method::GET, Method::HEAD],
        }
    }
}

impl CacheConfig {
    /// Defaults rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn caches_method(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            root: settings.directory.clone(),
            key_mask: settings.key_mask,
            freshness: settings.freshness.clone(),
            use_stale: settings.use_stale,
            populate_wait_timeout: settings.populate_wait,
            reclaim_interval: settings.reclaim_interval,
            reclaim_grace: settings.reclaim_grace,
            methods: settings.methods.clone(),
        }
    }
}
