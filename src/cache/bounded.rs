//! Capacity- and memory-bounded LRU cache for expensive derived values.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Caller-supplied estimate of a value's memory footprint in bytes.
pub type SizeFn<V> = Arc<dyn Fn(&V) -> usize + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BoundedStats {
    pub item_count: usize,
    pub memory_usage_bytes: usize,
    pub max_capacity: usize,
    pub max_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Slots<K: Hash + Eq, V> {
    // ordering is tracked by LruCache; both ceilings are enforced here
    entries: LruCache<K, (V, usize)>,
    memory: usize,
}

impl<K: Hash + Eq, V> Slots<K, V> {
    fn pop_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((_, (_, size))) => {
                self.memory -= size;
                true
            }
            None => false,
        }
    }
}

pub struct BoundedCache<K: Hash + Eq, V> {
    slots: Mutex<Slots<K, V>>,
    max_capacity: usize,
    max_memory_bytes: usize,
    size_of: SizeFn<V>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
    pub fn new(max_capacity: usize, max_memory_bytes: usize, size_of: SizeFn<V>) -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: LruCache::unbounded(),
                memory: 0,
            }),
            max_capacity: max_capacity.max(1),
            max_memory_bytes,
            size_of,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Inserts or replaces `key`, evicting least-recently-used entries until
    /// both ceilings hold. Returns `false` when the value alone exceeds the
    /// memory ceiling; the cache is left untouched in that case.
    pub fn set(&self, key: K, value: V) -> bool {
        let size = (self.size_of)(&value);
        if size > self.max_memory_bytes {
            debug!(size, max = self.max_memory_bytes, "value too large for cache");
            return false;
        }

        let mut slots = self.slots.lock();
        if let Some((_, old_size)) = slots.entries.put(key, (value, size)) {
            slots.memory -= old_size;
        }
        slots.memory += size;

        let mut evicted = 0;
        while slots.entries.len() > self.max_capacity || slots.memory > self.max_memory_bytes {
            if !slots.pop_lru() {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        true
    }

    /// Promotes the entry to most-recently-used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut slots = self.slots.lock();
        match slots.entries.get(key) {
            Some((value, _)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.lock().entries.contains(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut slots = self.slots.lock();
        let (value, size) = slots.entries.pop(key)?;
        slots.memory -= size;
        Some(value)
    }

    /// Keeps only entries for which `keep` returns true. Returns how many went.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut slots = self.slots.lock();
        let doomed: Vec<K> = slots
            .entries
            .iter()
            .filter(|(key, (value, _))| !keep(*key, value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some((_, size)) = slots.entries.pop(key) {
                slots.memory -= size;
            }
        }
        doomed.len()
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.entries.clear();
        slots.memory = 0;
    }

    /// Shrinks to half of capacity regardless of current pressure.
    pub fn trim_excess(&self) -> usize {
        let target = self.max_capacity / 2;
        let mut slots = self.slots.lock();
        let mut removed = 0;
        while slots.entries.len() > target && slots.pop_lru() {
            removed += 1;
        }
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = slots.entries.len(), "trimmed bounded cache");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> BoundedStats {
        let slots = self.slots.lock();
        BoundedStats {
            item_count: slots.entries.len(),
            memory_usage_bytes: slots.memory,
            max_capacity: self.max_capacity,
            max_memory_bytes: self.max_memory_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_sized(capacity: usize, max_memory: usize) -> BoundedCache<String, u32> {
        BoundedCache::new(capacity, max_memory, Arc::new(|_: &u32| 1usize))
    }

    fn assert_within_ceilings<K: Hash + Eq + Clone, V: Clone>(cache: &BoundedCache<K, V>) {
        let stats = cache.statistics();
        assert!(stats.item_count <= stats.max_capacity);
        assert!(stats.memory_usage_bytes <= stats.max_memory_bytes);
    }

    #[test]
    fn test_get_promotes_before_eviction() {
        let cache = unit_sized(3, 1_000);
        cache.set("k1".into(), 1);
        cache.set("k2".into(), 2);
        cache.set("k3".into(), 3);
        assert_eq!(cache.get(&"k1".into()), Some(1));
        cache.set("k4".into(), 4);

        assert!(!cache.contains(&"k2".into()));
        assert!(cache.contains(&"k1".into()));
        assert!(cache.contains(&"k3".into()));
        assert!(cache.contains(&"k4".into()));
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[test]
    fn test_memory_ceiling_evicts_lru() {
        let cache: BoundedCache<u32, Vec<u8>> =
            BoundedCache::new(100, 100, Arc::new(|v: &Vec<u8>| v.len()));
        cache.set(1, vec![0; 40]);
        cache.set(2, vec![0; 40]);
        cache.set(3, vec![0; 40]);

        assert!(!cache.contains(&1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.statistics().memory_usage_bytes, 80);
        assert_within_ceilings(&cache);
    }

    #[test]
    fn test_oversized_value_not_admitted() {
        let cache: BoundedCache<u32, Vec<u8>> =
            BoundedCache::new(10, 50, Arc::new(|v: &Vec<u8>| v.len()));
        cache.set(1, vec![0; 10]);
        assert!(!cache.set(2, vec![0; 51]));
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert_eq!(cache.statistics().memory_usage_bytes, 10);
    }

    #[test]
    fn test_replace_updates_memory() {
        let cache: BoundedCache<u32, Vec<u8>> =
            BoundedCache::new(10, 1_000, Arc::new(|v: &Vec<u8>| v.len()));
        cache.set(1, vec![0; 100]);
        cache.set(1, vec![0; 30]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.statistics().memory_usage_bytes, 30);
        assert_eq!(cache.remove(&1).map(|v| v.len()), Some(30));
        assert_eq!(cache.statistics().memory_usage_bytes, 0);
    }

    #[test]
    fn test_trim_excess_halves_full_cache() {
        let cache = unit_sized(10, 1_000);
        for i in 0..10 {
            cache.set(format!("k{i}"), i);
        }
        assert_eq!(cache.len(), 10);
        cache.trim_excess();
        assert!(cache.len() <= 5);
        // most recent survive
        assert!(cache.contains(&"k9".into()));
    }

    #[test]
    fn test_retain_and_clear() {
        let cache = unit_sized(10, 1_000);
        for i in 0..6 {
            cache.set(format!("k{i}"), i);
        }
        assert_eq!(cache.retain(|_, v| v % 2 == 0), 3);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.statistics().memory_usage_bytes, 3);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.statistics().memory_usage_bytes, 0);
    }

    #[test]
    fn test_concurrent_workers_respect_ceilings() {
        let cache = Arc::new(unit_sized(16, 12));
        std::thread::scope(|scope| {
            for worker in 0..10u32 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for op in 0..100u32 {
                        let key = format!("k{}", (worker * 7 + op) % 24);
                        if op % 2 == 0 {
                            cache.set(key, op);
                        } else {
                            let _ = cache.get(&key);
                        }
                        assert_within_ceilings(&cache);
                    }
                });
            }
        });

        let stats = cache.statistics();
        assert!(stats.item_count <= 12);
        assert_within_ceilings(&cache);
    }

    #[test]
    fn test_same_key_race_last_write_wins() {
        let cache = Arc::new(unit_sized(4, 100));
        std::thread::scope(|scope| {
            for worker in 0..8u32 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for _ in 0..50 {
                        cache.set("shared".into(), worker);
                    }
                });
            }
        });
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&"shared".into()).is_some_and(|v| v < 8));
        assert_eq!(cache.statistics().memory_usage_bytes, 1);
    }
}
