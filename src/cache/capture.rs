//! Tee of a handler's output into the client writer and a staged cache entry.

use std::io;
use std::time::SystemTime;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use metrics::counter;
use tracing::{debug, warn};

use super::METRIC_STORE_ERROR_TOTAL;
use super::keys::{CacheKey, Fingerprint};
use super::policy::{self, Cacheability, FreshnessPolicy};
use super::sink::ResponseWriter;
use super::store::{CacheStore, EntryWriter, StoreError};

const SOURCE: &str = "cache::capture";

/// Wraps the client writer for the duration of one populate.
///
/// Cache-side failures never reach the handler: they are logged, the staged
/// entry is dropped and the response continues uncached.
pub struct ResponseCapture<'a> {
    inner: &'a mut dyn ResponseWriter,
    store: &'a CacheStore,
    policy: &'a FreshnessPolicy,
    key: &'a CacheKey,
    fingerprint: Fingerprint,
    decision: Option<Cacheability>,
    entry: Option<EntryWriter>,
}

impl<'a> ResponseCapture<'a> {
    pub fn new(
        inner: &'a mut dyn ResponseWriter,
        store: &'a CacheStore,
        policy: &'a FreshnessPolicy,
        key: &'a CacheKey,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            inner,
            store,
            policy,
            key,
            fingerprint,
            decision: None,
            entry: None,
        }
    }

    pub fn decision(&self) -> Option<Cacheability> {
        self.decision
    }

    pub fn is_storing(&self) -> bool {
        self.entry.is_some()
    }

    /// Publish the staged entry. Returns whether an entry was stored.
    pub async fn finish(mut self) -> bool {
        let Some(entry) = self.entry.take() else {
            return false;
        };
        let bytes = entry.body_bytes();
        match entry.commit().await {
            Ok(path) => {
                debug!(
                    target = SOURCE,
                    op = "commit",
                    key = %self.key,
                    path = %path.display(),
                    body_bytes = bytes,
                    "Stored cache entry"
                );
                true
            }
            Err(err) => {
                self.cache_failed("commit", &err);
                false
            }
        }
    }

    /// Discard whatever was staged.
    pub fn abandon(mut self) {
        if self.entry.take().is_some() {
            debug!(
                target = SOURCE,
                op = "abandon",
                key = %self.key,
                "Discarded partial cache entry"
            );
        }
    }

    async fn decide(&mut self, status: StatusCode) -> io::Result<()> {
        let decision = policy::decide(
            self.inner.headers_mut(),
            status,
            self.policy,
            SystemTime::now(),
        );
        self.decision = Some(decision);

        let max_age_secs = match decision {
            Cacheability::Bypass(reason) => {
                debug!(
                    target = SOURCE,
                    op = "decide",
                    key = %self.key,
                    status = status.as_u16(),
                    reason = reason.as_str(),
                    "Response not cacheable"
                );
                return self.inner.write_status(status).await;
            }
            Cacheability::Store { max_age_secs } => max_age_secs,
        };

        let stored_headers: HeaderMap = self.inner.headers_mut().clone();
        if let Ok(value) = HeaderValue::from_str(&format!("maxage={max_age_secs}")) {
            self.inner.headers_mut().insert(header::CACHE_CONTROL, value);
        }

        let client = self.inner.write_status(status).await;

        match self
            .store
            .begin_write(self.key, status, self.fingerprint, &stored_headers)
            .await
        {
            Ok(entry) => self.entry = Some(entry),
            Err(err) => self.cache_failed("begin_write", &err),
        }

        client
    }

    fn cache_failed(&self, op: &'static str, err: &StoreError) {
        warn!(
            target = SOURCE,
            op,
            key = %self.key,
            kind = err.kind(),
            error = %err,
            result = "uncached",
            "Cache write failed; serving response uncached"
        );
        counter!(METRIC_STORE_ERROR_TOTAL, "kind" => err.kind()).increment(1);
    }
}

#[async_trait]
impl ResponseWriter for ResponseCapture<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    async fn write_status(&mut self, status: StatusCode) -> io::Result<()> {
        if self.decision.is_some() {
            return Ok(());
        }
        self.decide(status).await
    }

    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.decision.is_none() {
            self.decide(StatusCode::OK).await?;
        }

        let client = self.inner.write_body(chunk).await;

        let failed = match self.entry.as_mut() {
            Some(entry) => entry.write_body(chunk).await.err(),
            None => None,
        };
        if let Some(err) = failed {
            self.entry = None;
            self.cache_failed("write_body", &StoreError::Io(err));
        }

        client
    }

    fn status(&self) -> Option<StatusCode> {
        self.inner.status()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::cache::keys::{KeyMask, KeyRequest, compute_key};
    use crate::cache::policy::BypassReason;
    use crate::cache::sink::BufferedWriter;

    fn key_for(path: &'static str) -> (CacheKey, Fingerprint) {
        compute_key(
            KeyMask::default(),
            &KeyRequest {
                method: "GET",
                path,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn cacheable_response_reaches_client_and_disk() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let policy = FreshnessPolicy::default();
        let (key, fingerprint) = key_for("/tee");
        let mut client = BufferedWriter::new();

        let mut capture = ResponseCapture::new(&mut client, &store, &policy, &key, fingerprint);
        capture
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        capture
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=5"));
        capture.write_status(StatusCode::OK).await.unwrap();
        capture.write_body(b"hel").await.unwrap();
        capture.write_body(b"lo").await.unwrap();
        assert_eq!(capture.decision(), Some(Cacheability::Store { max_age_secs: 5 }));
        assert!(capture.finish().await);

        assert_eq!(client.body(), b"hello");
        assert_eq!(
            client.sent_headers().unwrap()[header::CACHE_CONTROL],
            "maxage=5"
        );

        let entry = store.read(&key, fingerprint, &policy).await.unwrap();
        assert_eq!(entry.status, StatusCode::OK);
        assert!(entry.headers.get(header::CACHE_CONTROL).is_none());
        assert_eq!(entry.headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(entry.into_body_bytes().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn uncacheable_response_only_reaches_client() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let policy = FreshnessPolicy::default();
        let (key, fingerprint) = key_for("/private");
        let mut client = BufferedWriter::new();

        let mut capture = ResponseCapture::new(&mut client, &store, &policy, &key, fingerprint);
        capture
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        capture.write_body(b"secret").await.unwrap();
        assert_eq!(
            capture.decision(),
            Some(Cacheability::Bypass(BypassReason::NoStore))
        );
        assert!(!capture.is_storing());
        assert!(!capture.finish().await);

        assert_eq!(client.status(), Some(StatusCode::OK));
        assert_eq!(client.body(), b"secret");
        assert!(!store.entry_path(&key).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn implicit_status_uses_status_validity() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let policy =
            FreshnessPolicy::empty().with_validity(std::time::Duration::from_secs(90), &[200]);
        let (key, fingerprint) = key_for("/implicit");
        let mut client = BufferedWriter::new();

        let mut capture = ResponseCapture::new(&mut client, &store, &policy, &key, fingerprint);
        capture.write_body(b"x").await.unwrap();
        assert_eq!(capture.decision(), Some(Cacheability::Store { max_age_secs: 90 }));
        capture.finish().await;

        assert_eq!(
            client.sent_headers().unwrap()[header::CACHE_CONTROL],
            "maxage=90"
        );
    }

    #[tokio::test]
    async fn abandoned_capture_stores_nothing() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let policy = FreshnessPolicy::default();
        let (key, fingerprint) = key_for("/abandon");
        let mut client = BufferedWriter::new();

        let mut capture = ResponseCapture::new(&mut client, &store, &policy, &key, fingerprint);
        capture.write_body(b"half").await.unwrap();
        assert!(capture.is_storing());
        capture.abandon();

        assert!(!store.entry_path(&key).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn second_status_is_ignored() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let policy = FreshnessPolicy::default();
        let (key, fingerprint) = key_for("/twice");
        let mut client = BufferedWriter::new();

        let mut capture = ResponseCapture::new(&mut client, &store, &policy, &key, fingerprint);
        capture.write_status(StatusCode::OK).await.unwrap();
        capture
            .write_status(StatusCode::INTERNAL_SERVER_ERROR)
            .await
            .unwrap();
        capture.finish().await;

        let entry = store.read(&key, fingerprint, &policy).await.unwrap();
        assert_eq!(entry.status, StatusCode::OK);
        assert_eq!(client.status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn unwritable_root_degrades_to_uncached() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let store = CacheStore::new(&blocker);
        let policy = FreshnessPolicy::default();
        let (key, fingerprint) = key_for("/blocked");
        let mut client = BufferedWriter::new();

        let mut capture = ResponseCapture::new(&mut client, &store, &policy, &key, fingerprint);
        capture.write_body(b"still served").await.unwrap();
        assert!(!capture.is_storing());
        assert!(!capture.finish().await);

        assert_eq!(client.body(), b"still served");
    }
}
