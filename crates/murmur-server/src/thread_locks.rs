//! Per-thread mutual exclusion for the read-generate-write sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Debug, Default)]
/// Hands out one async mutex per thread key so concurrent events in
/// the same Slack thread cannot interleave their context reads and
/// writes. Entries are reclaimed once the last holder or waiter for a
/// key is gone, so the map tracks only threads with in-flight work.
/// In-process only; a multi-instance deployment would swap this seam
/// for a distributed lock.
pub struct ThreadLocks {
    inner: Arc<LockMap>,
}

/// Holds the per-thread lock. Dropping it releases the lock and prunes
/// the map entry when no other task holds or awaits the same key.
pub struct ThreadLockGuard {
    key: String,
    map: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadLockGuard {
    fn drop(&mut self) {
        // Release the async mutex before inspecting reference counts,
        // otherwise our own guard still pins the Arc.
        self.guard.take();
        let mut map = self.map.lock().expect("thread lock map is poisoned");
        if let Some(lock) = map.get(&self.key) {
            // Waiters cloned the Arc under the map lock, so a count of
            // one means only the map itself still references the key.
            if Arc::strong_count(lock) == 1 {
                map.remove(&self.key);
            }
        }
    }
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> ThreadLockGuard {
        let lock = {
            let mut map = self.inner.lock().expect("thread lock map is poisoned");
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        ThreadLockGuard {
            key: key.to_string(),
            map: Arc::clone(&self.inner),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.inner
            .lock()
            .expect("thread lock map is poisoned")
            .len()
    }
}
