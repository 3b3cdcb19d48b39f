//! Capacity-bounded LRU cache.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    charge: usize,
}

struct LruInner<K, V> {
    map: HashMap<K, Entry<V>>,
    /// Access order, oldest first. Every live key appears exactly once;
    /// each access moves its slot to the back.
    queue: VecDeque<K>,
    usage: usize,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruInner<K, V> {
    /// Moves `key`'s queue slot to the back, adding one if absent.
    fn touch(&mut self, key: &K) {
        if let Some(position) = self.queue.iter().position(|k| k == key) {
            self.queue.remove(position);
        }
        self.queue.push_back(key.clone());
    }

    fn remove_slot(&mut self, key: &K) {
        if let Some(position) = self.queue.iter().position(|k| k == key) {
            self.queue.remove(position);
        }
    }
}

/// A thread-safe LRU cache bounded by total charge (bytes for the block
/// cache, handle count for the table cache).
pub struct LruCache<K: Eq + Hash + Clone, V: Clone> {
    inner: Mutex<LruInner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` total charge.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                queue: VecDeque::new(),
                usage: 0,
                capacity,
            }),
        }
    }

    /// Looks up `key`, refreshing its recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let value = inner.map.get(key)?.value.clone();
        inner.touch(key);
        Some(value)
    }

    /// Inserts `key -> value` with the given charge, evicting the least
    /// recently used entries if over capacity. An entry whose charge
    /// alone exceeds the capacity is not cached at all; it would only
    /// flush everything else on its way through.
    pub fn insert(&self, key: K, value: V, charge: usize) {
        let mut inner = self.inner.lock();
        if charge > inner.capacity {
            return;
        }

        if let Some(old) = inner.map.insert(key.clone(), Entry { value, charge }) {
            inner.usage -= old.charge;
        }
        inner.usage += charge;
        inner.touch(&key);

        while inner.usage > inner.capacity {
            match inner.queue.pop_front() {
                Some(old_key) => {
                    let removed = inner.map.remove(&old_key).expect("queue tracks the map");
                    inner.usage -= removed.charge;
                }
                None => break,
            }
        }
    }

    /// Removes `key` if present.
    pub fn erase(&self, key: &K) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.map.remove(key) {
            inner.usage -= entry.charge;
            inner.remove_slot(key);
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// True if no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current total charge.
    pub fn usage(&self) -> usize {
        self.inner.lock().usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache: LruCache<u64, String> = LruCache::new(100);
        cache.insert(1, "one".to_string(), 10);
        cache.insert(2, "two".to_string(), 10);

        assert_eq!(cache.get(&1), Some("one".to_string()));
        assert_eq!(cache.get(&2), Some("two".to_string()));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.usage(), 20);
    }

    #[test]
    fn test_eviction_order() {
        let cache: LruCache<u64, u64> = LruCache::new(30);
        cache.insert(1, 1, 10);
        cache.insert(2, 2, 10);
        cache.insert(3, 3, 10);

        // Touch 1 so 2 becomes the eviction candidate.
        cache.get(&1);
        cache.insert(4, 4, 10);

        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&3), Some(3));
        assert_eq!(cache.get(&4), Some(4));
    }

    #[test]
    fn test_hits_do_not_grow_bookkeeping() {
        let cache: LruCache<u64, u64> = LruCache::new(30);
        cache.insert(1, 1, 10);
        cache.insert(2, 2, 10);
        cache.insert(3, 3, 10);

        // A warm read-only workload: every access is a hit. The queue
        // holds one slot per live key, so the next eviction decision is
        // still exact.
        for _ in 0..10_000 {
            cache.get(&1);
            cache.get(&2);
        }
        let queue_len = cache.inner.lock().queue.len();
        assert_eq!(queue_len, cache.len());

        // 3 is now the least recently used and the one to go.
        cache.insert(4, 4, 10);
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&2), Some(2));
        assert_eq!(cache.get(&4), Some(4));
    }

    #[test]
    fn test_overwrite_updates_charge() {
        let cache: LruCache<u64, u64> = LruCache::new(100);
        cache.insert(1, 1, 40);
        cache.insert(1, 2, 10);
        assert_eq!(cache.usage(), 10);
        assert_eq!(cache.get(&1), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_erase() {
        let cache: LruCache<u64, u64> = LruCache::new(100);
        cache.insert(1, 1, 10);
        cache.erase(&1);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.usage(), 0);
        // Erasing again is a no-op.
        cache.erase(&1);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache: LruCache<u64, u64> = LruCache::new(0);
        cache.insert(1, 1, 10);
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_oversized_entry_not_cached() {
        let cache: LruCache<u64, u64> = LruCache::new(50);
        cache.insert(1, 1, 20);
        cache.insert(2, 2, 20);
        // Larger than the whole cache: rejected outright, everything
        // else stays resident.
        cache.insert(3, 3, 51);
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&2), Some(2));
        assert_eq!(cache.usage(), 40);
    }
}
