//! A small time-to-live cache for read-mostly lookups.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Map whose entries expire `ttl` after insertion.
///
/// Expired entries are dropped lazily on access and pruned wholesale by
/// [`TtlCache::len`], so the map stays bounded by the live working set.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live value for `key`, dropping it if expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some((inserted, value)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            },
            None => None,
        }
    }

    /// Inserts or refreshes `key`.
    pub fn put(&self, key: K, value: V) {
        self.lock().insert(key, (Instant::now(), value));
    }

    /// Number of live entries; prunes expired ones first.
    pub fn len(&self) -> usize {
        let mut entries = self.lock();
        let ttl = self.ttl;
        entries.retain(|_, (inserted, _)| inserted.elapsed() < ttl);
        entries.len()
    }

    /// True if no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, (Instant, V)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_live_until_ttl() {
        let cache = TtlCache::new(Duration::from_millis(50));
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.len(), 1);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn put_refreshes_expiry() {
        let cache = TtlCache::new(Duration::from_millis(80));
        cache.put("a", 1);
        std::thread::sleep(Duration::from_millis(50));
        cache.put("a", 2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get(&"a"), Some(2));
    }
}
