use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lru::LruCache;
use parking_lot::Mutex;

/// A payload served from the memory tier.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub payload: Arc<[u8]>,
    pub mtime: SystemTime,
    pub size: u64,
}

#[derive(Debug)]
struct MemoryEntry {
    payload: Arc<[u8]>,
    size: u64,
    mtime: SystemTime,
}

#[derive(Debug)]
struct MemoryState {
    lru: LruCache<String, MemoryEntry>,
    bytes_in_use: u64,
}

/// Byte-bounded LRU over encoded variants. Entries larger than the chunk cap
/// bypass the tier entirely; total bytes are enforced by evicting from the
/// tail after each insert.
#[derive(Debug)]
pub(super) struct MemoryCache {
    state: Mutex<MemoryState>,
    limit: u64,
    chunk: u64,
}

impl MemoryCache {
    pub(super) fn new(limit: u64, chunk: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
            }),
            limit,
            chunk,
        }
    }

    pub(super) fn store(&self, key: &str, payload: &[u8], mtime: SystemTime) {
        let size = payload.len() as u64;
        if size == 0 {
            self.remove(key);
            return;
        }
        if self.chunk > 0 && size > self.chunk {
            return;
        }
        if size > self.limit {
            return;
        }
        let entry = MemoryEntry {
            payload: Arc::from(payload),
            size,
            mtime,
        };
        let mut state = self.state.lock();
        if let Some(old) = state.lru.put(key.to_string(), entry) {
            state.bytes_in_use = state.bytes_in_use.saturating_sub(old.size);
        }
        state.bytes_in_use = state.bytes_in_use.saturating_add(size);
        while state.bytes_in_use > self.limit {
            match state.lru.pop_lru() {
                Some((_key, removed)) => {
                    state.bytes_in_use = state.bytes_in_use.saturating_sub(removed.size);
                }
                None => break,
            }
        }
    }

    /// Returns the entry iff it passes the same freshness predicate as the
    /// disk tier; a stale entry is evicted and reported as a miss.
    pub(super) fn load(
        &self,
        key: &str,
        origin_mtime: Option<SystemTime>,
        ttl: Duration,
    ) -> Option<MemoryHit> {
        let mut state = self.state.lock();
        let entry = state.lru.get(key)?;
        let outdated = origin_mtime.is_some_and(|origin| origin > entry.mtime);
        let expired = !ttl.is_zero()
            && entry
                .mtime
                .elapsed()
                .map(|age| age > ttl)
                .unwrap_or(false);
        if outdated || expired {
            if let Some(removed) = state.lru.pop(key) {
                state.bytes_in_use = state.bytes_in_use.saturating_sub(removed.size);
            }
            return None;
        }
        let entry = state.lru.get(key)?;
        Some(MemoryHit {
            payload: entry.payload.clone(),
            mtime: entry.mtime,
            size: entry.size,
        })
    }

    pub(super) fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(removed) = state.lru.pop(key) {
            state.bytes_in_use = state.bytes_in_use.saturating_sub(removed.size);
        }
    }

    #[cfg(test)]
    pub(super) fn bytes_in_use(&self) -> u64 {
        self.state.lock().bytes_in_use
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.state.lock().lru.len()
    }
}
