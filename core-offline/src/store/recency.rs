//! In-memory recency index backing LRU eviction.

use lru::LruCache;
use parking_lot::Mutex;

/// Access order of cached tracks, value is the last access in epoch millis.
#[derive(Debug)]
pub struct RecencyTracker {
    entries: Mutex<LruCache<String, i64>>,
}

impl RecencyTracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn touch(&self, uid: &str, at_millis: i64) {
        self.entries.lock().put(uid.to_string(), at_millis);
    }

    pub fn forget(&self, uid: &str) {
        self.entries.lock().pop(uid);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.lock().contains(uid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Least recently used first.
    pub fn oldest_first(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .rev()
            .map(|(uid, _)| uid.clone())
            .collect()
    }
}

impl Default for RecencyTracker {
    fn default() -> Self {
        Self::new()
    }
}
