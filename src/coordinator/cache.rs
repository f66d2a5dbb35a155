//! Bounded LRU read cache kept by the coordinator
//!
//! Purely advisory: replicas and their logs are the system of record. The
//! coordinator only mutates an entry while holding that key's write lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

struct CacheInner {
    map: HashMap<Vec<u8>, CacheEntry>,
    /// recency tick -> key, oldest first
    order: BTreeMap<u64, Vec<u8>>,
    tick: u64,
    capacity: usize,
}

struct CacheEntry {
    value: Vec<u8>,
    tick: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &[u8]) {
        let tick = self.next_tick();
        if let Some(entry) = self.map.get_mut(key) {
            let old = std::mem::replace(&mut entry.tick, tick);
            if let Some(k) = self.order.remove(&old) {
                self.order.insert(tick, k);
            }
        }
    }
}

pub struct ReadCache {
    inner: Mutex<CacheInner>,
}

impl ReadCache {
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
                capacity: capacity.max(1),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached value for `key`, marking it most recently used.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.lock();
        let value = inner.map.get(key).map(|e| e.value.clone())?;
        inner.touch(key);
        Some(value)
    }

    /// Insert or replace; returns whether the key was already cached.
    /// Evicts the least recently used entry when over capacity.
    pub fn put(&self, key: &[u8], value: Vec<u8>) -> bool {
        let mut inner = self.lock();

        if let Some(entry) = inner.map.get_mut(key) {
            entry.value = value;
            inner.touch(key);
            return true;
        }

        let tick = inner.next_tick();
        inner.map.insert(key.to_vec(), CacheEntry { value, tick });
        inner.order.insert(tick, key.to_vec());

        while inner.map.len() > inner.capacity {
            match inner.order.pop_first() {
                Some((_, evicted)) => {
                    inner.map.remove(&evicted);
                }
                None => break,
            }
        }
        false
    }

    /// Drop `key` if cached.
    pub fn del(&self, key: &[u8]) {
        let mut inner = self.lock();
        if let Some(entry) = inner.map.remove(key) {
            inner.order.remove(&entry.tick);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_reports_existing() {
        let cache = ReadCache::new(2);
        assert!(!cache.put(b"k", b"v".to_vec()));
        assert!(!cache.put(b"k1", b"v1".to_vec()));
        assert!(cache.put(b"k1", b"v1".to_vec()));
    }

    #[test]
    fn test_put_then_get() {
        let cache = ReadCache::new(2);
        cache.put(b"k", b"v".to_vec());
        cache.put(b"k", b"v1".to_vec());
        assert_eq!(cache.get(b"k"), Some(b"v1".to_vec()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_miss_has_no_side_effects() {
        let cache = ReadCache::new(2);
        assert_eq!(cache.get(b"missing"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_del() {
        let cache = ReadCache::new(2);
        cache.del(b"absent");
        cache.put(b"k", b"v".to_vec());
        cache.del(b"k");
        assert_eq!(cache.get(b"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = ReadCache::new(3);
        cache.put(b"a", b"1".to_vec());
        cache.put(b"b", b"2".to_vec());
        cache.put(b"c", b"3".to_vec());

        // Touch "a" so "b" becomes the oldest.
        assert!(cache.get(b"a").is_some());
        cache.put(b"d", b"4".to_vec());

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(b"b"), None);
        assert!(cache.get(b"a").is_some());
        assert!(cache.get(b"c").is_some());
        assert!(cache.get(b"d").is_some());
    }

    #[test]
    fn test_update_refreshes_recency() {
        let cache = ReadCache::new(2);
        cache.put(b"a", b"1".to_vec());
        cache.put(b"b", b"2".to_vec());
        cache.put(b"a", b"1'".to_vec());
        cache.put(b"c", b"3".to_vec());
        assert_eq!(cache.get(b"b"), None);
        assert_eq!(cache.get(b"a"), Some(b"1'".to_vec()));
    }

    #[test]
    fn test_capacity_n_plus_one() {
        let n = 5;
        let cache = ReadCache::new(n);
        for i in 0..=n {
            cache.put(format!("key-{}", i).as_bytes(), vec![i as u8]);
        }
        assert_eq!(cache.len(), n);
        assert_eq!(cache.get(b"key-0"), None);
        for i in 1..=n {
            assert_eq!(cache.get(format!("key-{}", i).as_bytes()), Some(vec![i as u8]));
        }
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let cache = ReadCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.put(b"a", b"1".to_vec());
        cache.put(b"b", b"2".to_vec());
        assert_eq!(cache.len(), 1);
        assert!(cache.get(b"b").is_some());
    }
}
