use lru::LruCache;
use parking_lot::Mutex;

#[derive(Debug)]
struct HotState {
    lru: LruCache<String, u64>,
    bytes_in_use: u64,
}

/// Size-bounded LRU of recently served cache paths. The sweeper consults it
/// before deleting TTL-expired files; a protected entry survives the sweep
/// and returns to the front.
#[derive(Debug)]
pub(super) struct HotSet {
    state: Mutex<HotState>,
    limit: u64,
}

impl HotSet {
    pub(super) fn new(limit: u64) -> Self {
        Self {
            state: Mutex::new(HotState {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
            }),
            limit,
        }
    }

    /// Upserts an entry at the front.
    pub(super) fn mark(&self, key: &str, size: u64) {
        if size == 0 {
            return;
        }
        let mut state = self.state.lock();
        if let Some(old) = state.lru.put(key.to_string(), size) {
            state.bytes_in_use = state.bytes_in_use.saturating_sub(old);
        }
        state.bytes_in_use = state.bytes_in_use.saturating_add(size);
        Self::enforce_limit(&mut state, self.limit);
    }

    /// Returns true iff the key is present, refreshing it to the front and
    /// updating its recorded size.
    pub(super) fn protect(&self, key: &str, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(recorded) = state.lru.get_mut(key) else {
            return false;
        };
        let previous = *recorded;
        *recorded = size;
        state.bytes_in_use = state
            .bytes_in_use
            .saturating_sub(previous)
            .saturating_add(size);
        Self::enforce_limit(state, self.limit);
        true
    }

    pub(super) fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(removed) = state.lru.pop(key) {
            state.bytes_in_use = state.bytes_in_use.saturating_sub(removed);
        }
    }

    fn enforce_limit(state: &mut HotState, limit: u64) {
        while state.bytes_in_use > limit {
            match state.lru.pop_lru() {
                Some((_key, removed)) => {
                    state.bytes_in_use = state.bytes_in_use.saturating_sub(removed);
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    pub(super) fn contains(&self, key: &str) -> bool {
        self.state.lock().lru.contains(key)
    }
}
