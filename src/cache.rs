// src/cache.rs
// In-process, time-based cache used where the spec calls for a "key-value
// cache" without naming a specific backend (template resolution, inbound
// dedupe). Grounded on the teacher's registry idiom (parking_lot::RwLock
// over a HashMap, see watcher/registry.rs) with TTL eviction added, since
// no generic in-memory cache exists in the teacher.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A bounded, TTL-based cache. Eviction is lazy: expired entries are dropped
/// on the next `get`/`insert` that touches them, plus an opportunistic sweep
/// once the map grows past `sweep_threshold`.
pub struct TtlCache<V: Clone> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    ttl: Duration,
    sweep_threshold: usize,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            sweep_threshold: 10_000,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            _ => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.write();
        entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
        if entries.len() > self.sweep_threshold {
            let now = Instant::now();
            entries.retain(|_, e| e.expires_at > now);
        }
    }

    /// Returns true if the key is already present (e.g. dedupe checks),
    /// regardless of the stored value.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));
        cache.insert("a", "b".to_string());
        assert_eq!(cache.get("a"), Some("b".to_string()));
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache: TtlCache<()> = TtlCache::new(Duration::from_millis(1));
        cache.insert("a", ());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn contains_reflects_presence() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        assert!(!cache.contains("x"));
        cache.insert("x", 1);
        assert!(cache.contains("x"));
    }
}
