//! Per-key async locks.
//!
//! Entries are held weakly: a key's lock lives only as long as someone holds
//! or waits on it, so the map does not grow with every conversation ever seen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`. Other keys are never blocked.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        // The map guard is dropped before any await.
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        self.locks
            .lock()
            .map(|l| l.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}
