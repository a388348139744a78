use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-key mutual exclusion for variant builds. Entries are created on
/// demand and reclaimed on release once no other waiter holds the same lock,
/// so the table stays bounded by the number of in-flight unique keys.
#[derive(Debug, Default)]
pub struct KeyedLocker {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the duration of one build; releasing is dropping.
pub struct KeyedGuard<'a> {
    locker: &'a KeyedLocker,
    key: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let lock = {
            let mut table = self.locks.lock();
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        KeyedGuard {
            locker: self,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.locker.locks.lock();
        if let Some(current) = table.get(&self.key) {
            // Identity check guards against a concurrently re-created entry.
            // Strong count of two means only the table and this guard still
            // reference the lock, i.e. no waiter is queued.
            if Arc::ptr_eq(current, &self.lock) && Arc::strong_count(current) <= 2 {
                table.remove(&self.key);
            }
        }
    }
}
