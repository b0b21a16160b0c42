use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

/// Lock a bookkeeping mutex, recovering the guard if a previous holder panicked.
///
/// The cache only keeps counters and state tags behind these mutexes, all of
/// which stay meaningful after a panic, so poisoning is logged and ignored.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, target, op))
}

fn recover<G>(poisoned: PoisonError<G>, target: &'static str, op: &'static str) -> G {
    warn!(
        op,
        target_module = target,
        lock_kind = "mutex.lock",
        result = "poisoned_recovered",
        hint = "a task panicked while holding cache bookkeeping",
        "Recovered from poisoned cache lock"
    );
    poisoned.into_inner()
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn poisoned_mutex_is_recovered() {
        let lock = Mutex::new(7_u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("fresh mutex locks");
            panic!("poison the mutex");
        }));
        assert!(lock.is_poisoned());

        let mut guard = mutex_lock(&lock, "cache::lock::tests", "poisoned_mutex_is_recovered");
        *guard += 1;
        assert_eq!(*guard, 8);
    }
}
