//! Per-key lock registry.
//!
//! Every request touching a key holds a shared lock on that key's record while
//! it reads. A miss upgrades through [`KeyLockHandle::try_become_writer`]: the
//! first caller becomes the single populating writer, everybody arriving while
//! it runs becomes a follower and waits for the published outcome instead of
//! invoking the handler again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::gauge;
use tokio::sync::{OwnedRwLockReadGuard, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use super::METRIC_LOCK_RECORDS;
use super::keys::CacheKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::registry";

/// How a populate attempt ended, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOutcome {
    /// The handler ran to completion. Whether the entry was stored is a
    /// separate question answered by reading it back.
    Completed,
    /// The handler failed, panicked, or the populating task was dropped.
    Failed,
    /// A follower stopped waiting before the writer finished.
    TimedOut,
}

impl PopulateOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer(PopulateOutcome),
    Follower(PopulateOutcome),
}

type Signal = Option<PopulateOutcome>;

#[derive(Debug)]
enum PopulateState {
    Idle,
    Populating(watch::Receiver<Signal>),
}

#[derive(Debug)]
struct KeyLockRecord {
    access: Arc<RwLock<()>>,
    state: Mutex<PopulateState>,
}

impl KeyLockRecord {
    fn new() -> Self {
        Self {
            access: Arc::new(RwLock::new(())),
            state: Mutex::new(PopulateState::Idle),
        }
    }
}

#[derive(Debug)]
struct Slot {
    refs: usize,
    last_release: Instant,
    record: Arc<KeyLockRecord>,
}

/// Registry of per-key lock records, owned by one orchestrator.
#[derive(Debug, Default)]
pub struct KeyLockRegistry {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl KeyLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key` and wait for shared access to it.
    pub async fn acquire(self: &Arc<Self>, key: &CacheKey) -> KeyLockHandle {
        let record = {
            let mut slots = mutex_lock(&self.slots, SOURCE, "acquire");
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                refs: 0,
                last_release: Instant::now(),
                record: Arc::new(KeyLockRecord::new()),
            });
            slot.refs += 1;
            let record = Arc::clone(&slot.record);
            gauge!(METRIC_LOCK_RECORDS).set(slots.len() as f64);
            record
        };

        // Build the handle first so a cancelled wait still drops the reference.
        let mut handle = KeyLockHandle {
            registry: Arc::clone(self),
            key: key.clone(),
            record,
            shared: None,
        };
        handle.shared = Some(Arc::clone(&handle.record.access).read_owned().await);
        handle
    }

    /// Drop records nobody references and nobody released within `grace`.
    pub fn reclaim_idle(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let mut slots = mutex_lock(&self.slots, SOURCE, "reclaim_idle");
        let before = slots.len();
        slots.retain(|_, slot| slot.refs > 0 || now.duration_since(slot.last_release) < grace);
        gauge!(METRIC_LOCK_RECORDS).set(slots.len() as f64);
        before - slots.len()
    }

    /// Periodically reclaim idle records until the registry is dropped.
    pub fn spawn_reclaimer(self: &Arc<Self>, interval: Duration, grace: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.reclaim_idle(grace);
                if removed > 0 {
                    debug!(
                        target = SOURCE,
                        op = "reclaim_idle",
                        removed,
                        remaining = registry.len(),
                        "Reclaimed idle key lock records"
                    );
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.slots, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live handles for `key`, zero when the key has no record.
    pub fn ref_count(&self, key: &CacheKey) -> usize {
        mutex_lock(&self.slots, SOURCE, "ref_count")
            .get(key)
            .map_or(0, |slot| slot.refs)
    }

    fn release(&self, key: &CacheKey) {
        let mut slots = mutex_lock(&self.slots, SOURCE, "release");
        if let Some(slot) = slots.get_mut(key) {
            slot.refs = slot.refs.saturating_sub(1);
            slot.last_release = Instant::now();
        }
    }
}

/// One request's claim on a key. Dropping it releases the claim.
#[derive(Debug)]
pub struct KeyLockHandle {
    registry: Arc<KeyLockRegistry>,
    key: CacheKey,
    record: Arc<KeyLockRecord>,
    shared: Option<OwnedRwLockReadGuard<()>>,
}

enum Claim {
    Lead(watch::Sender<Signal>),
    Follow(watch::Receiver<Signal>),
}

impl KeyLockHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn release(self) {}

    /// Give up shared access and either run `populate` as the key's single
    /// writer or wait for the writer already running.
    ///
    /// The writer holds the exclusive lock for the duration of `populate` and
    /// leaves with a shared lock. A follower leaves with a shared lock too,
    /// except after a timeout, where waiting for the lock would mean waiting
    /// for the writer after all.
    pub async fn try_become_writer<F, Fut>(
        &mut self,
        timeout: Option<Duration>,
        populate: F,
    ) -> Role
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PopulateOutcome>,
    {
        self.shared = None;

        let claim = {
            let mut state = mutex_lock(&self.record.state, SOURCE, "try_become_writer");
            let running = match &*state {
                PopulateState::Populating(rx) => Some(rx.clone()),
                PopulateState::Idle => None,
            };
            match running {
                Some(rx) => Claim::Follow(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *state = PopulateState::Populating(rx);
                    Claim::Lead(tx)
                }
            }
        };

        match claim {
            Claim::Lead(tx) => Role::Writer(self.lead(tx, populate).await),
            Claim::Follow(rx) => Role::Follower(self.follow(rx, timeout).await),
        }
    }

    async fn lead<F, Fut>(&mut self, tx: watch::Sender<Signal>, populate: F) -> PopulateOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PopulateOutcome>,
    {
        let mut signal = PopulateSignal {
            record: Arc::clone(&self.record),
            tx: Some(tx),
        };

        let exclusive = Arc::clone(&self.record.access).write_owned().await;
        let outcome = populate().await;
        signal.publish(outcome);
        self.shared = Some(exclusive.downgrade());
        outcome
    }

    async fn follow(
        &mut self,
        mut rx: watch::Receiver<Signal>,
        timeout: Option<Duration>,
    ) -> PopulateOutcome {
        let wait = async move {
            match rx.wait_for(Option::is_some).await {
                Ok(signal) => (*signal).unwrap_or(PopulateOutcome::Failed),
                Err(_) => PopulateOutcome::Failed,
            }
        };

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .unwrap_or(PopulateOutcome::TimedOut),
            None => wait.await,
        };

        if outcome != PopulateOutcome::TimedOut {
            self.shared = Some(Arc::clone(&self.record.access).read_owned().await);
        }
        outcome
    }
}

impl Drop for KeyLockHandle {
    fn drop(&mut self) {
        // The shared guard field is dropped after this body runs.
        self.registry.release(&self.key);
    }
}

/// Publishes the writer's outcome exactly once; a drop without publishing
/// reports `Failed` so followers never wait on a cancelled writer.
struct PopulateSignal {
    record: Arc<KeyLockRecord>,
    tx: Option<watch::Sender<Signal>>,
}

impl PopulateSignal {
    fn publish(&mut self, outcome: PopulateOutcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        *mutex_lock(&self.record.state, SOURCE, "publish") = PopulateState::Idle;
        tx.send_replace(Some(outcome));
    }
}

impl Drop for PopulateSignal {
    fn drop(&mut self) {
        self.publish(PopulateOutcome::Failed);
    }
}
