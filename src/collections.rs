// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use codec::TimeDuration;

/// Backing strategy of an [`OperationsMap`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CollectionStrategy {
    /// Hash-indexed, iteration order unspecified.
    Unordered,

    /// Entries iterate in insertion order.
    InsertionOrdered,

    /// Safe to share between threads behind `&self`.
    Concurrent,
}

/// Timing counters kept per collection.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectionMetrics {
    pub operation_count: u64,
    pub total_time: TimeDuration,
}

impl CollectionMetrics {
    fn update(&mut self, elapsed: TimeDuration) {
        self.operation_count += 1;
        self.total_time = self.total_time + elapsed;
    }

    /// Mean time per operation.
    #[must_use]
    pub fn average_time(&self) -> TimeDuration {
        if self.operation_count == 0 {
            TimeDuration::zero()
        } else {
            self.total_time / self.operation_count as i64
        }
    }
}

type KeyHashFn<K> = Arc<dyn Fn(&K) -> u64 + Send + Sync>;
type KeyEqualFn<K> = Arc<dyn Fn(&K, &K) -> bool + Send + Sync>;

struct MapInner<K, V> {
    entries: Vec<(K, V)>,
    index: HashMap<u64, Vec<usize>>,
    metrics: CollectionMetrics,
}

/// Mapping with optional caller-supplied key equality.
///
/// Keys are bucketed by a derived hash and verified with the equality
/// predicate, so `put` replaces an existing entry whenever the predicate
/// accepts some stored key. All strategies are usable behind `&self`; the
/// `Concurrent` strategy only documents that sharing is intended.
pub struct OperationsMap<K, V> {
    strategy: CollectionStrategy,
    hash_fn: KeyHashFn<K>,
    equal_fn: KeyEqualFn<K>,
    inner: Mutex<MapInner<K, V>>,
}

impl<K, V> OperationsMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create a map using ordinary key hashing and equality.
    #[must_use]
    pub fn new(strategy: CollectionStrategy) -> Self {
        Self::with_key_fns(
            strategy,
            Arc::new(|key: &K| {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                hasher.finish()
            }),
            Arc::new(|a: &K, b: &K| a == b),
        )
    }
}

impl<K, V> OperationsMap<K, V>
where
    K: Clone,
    V: Clone,
{
    /// Create a map with a caller-supplied hash extractor and equality
    /// predicate.
    #[must_use]
    pub fn with_key_fns(
        strategy: CollectionStrategy,
        hash_fn: KeyHashFn<K>,
        equal_fn: KeyEqualFn<K>,
    ) -> Self {
        Self {
            strategy,
            hash_fn,
            equal_fn,
            inner: Mutex::new(MapInner {
                entries: Vec::new(),
                index: HashMap::new(),
                metrics: CollectionMetrics::default(),
            }),
        }
    }

    #[must_use]
    pub const fn strategy(&self) -> CollectionStrategy {
        self.strategy
    }

    /// Insert `value`, replacing the entry whose key the equality
    /// predicate matches.
    pub fn put(&self, key: K, value: V) {
        let start = Instant::now();
        let hash = (self.hash_fn)(&key);
        let mut inner = self.lock();
        let slot = inner
            .index
            .get(&hash)
            .and_then(|bucket| {
                bucket
                    .iter()
                    .copied()
                    .find(|&i| (self.equal_fn)(&inner.entries[i].0, &key))
            });
        match slot {
            Some(i) => inner.entries[i] = (key, value),
            None => {
                let i = inner.entries.len();
                inner.entries.push((key, value));
                inner.index.entry(hash).or_default().push(i);
            }
        }
        inner.metrics.update(TimeDuration::from_std(start.elapsed()));
    }

    /// Value stored under a key the equality predicate matches.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let start = Instant::now();
        let hash = (self.hash_fn)(key);
        let mut inner = self.lock();
        let found = inner.index.get(&hash).and_then(|bucket| {
            bucket
                .iter()
                .copied()
                .find(|&i| (self.equal_fn)(&inner.entries[i].0, key))
                .map(|i| inner.entries[i].1.clone())
        });
        inner.metrics.update(TimeDuration::from_std(start.elapsed()));
        found
    }

    /// Returns true if some stored key matches.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Remove the matching entry, returning whether one existed.
    pub fn remove(&self, key: &K) -> bool {
        let start = Instant::now();
        let hash = (self.hash_fn)(key);
        let mut inner = self.lock();
        let slot = inner.index.get(&hash).and_then(|bucket| {
            bucket
                .iter()
                .copied()
                .find(|&i| (self.equal_fn)(&inner.entries[i].0, key))
        });
        let removed = if let Some(i) = slot {
            inner.entries.remove(i);
            // Positions after the removal shifted; rebuild the index.
            let hash_fn = &self.hash_fn;
            let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
            for (pos, (stored, _)) in inner.entries.iter().enumerate() {
                index.entry(hash_fn(stored)).or_default().push(pos);
            }
            inner.index = index;
            true
        } else {
            false
        };
        inner.metrics.update(TimeDuration::from_std(start.elapsed()));
        removed
    }

    /// Remove all entries.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.index.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Snapshot of all entries, in insertion order for
    /// [`CollectionStrategy::InsertionOrdered`].
    #[must_use]
    pub fn items(&self) -> Vec<(K, V)> {
        self.lock().entries.clone()
    }

    /// Snapshot of the timing counters.
    #[must_use]
    pub fn metrics(&self) -> CollectionMetrics {
        self.lock().metrics
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MapInner<K, V>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Bounded mapping with least-recently-used eviction.
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
    hits: u64,
    misses: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Read a value, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some(value) = self.map.get(key).cloned() {
            self.touch(key);
            self.hits += 1;
            Some(value)
        } else {
            self.misses += 1;
            None
        }
    }

    /// Insert a value, evicting the least recently used entry on
    /// overflow.
    pub fn put(&mut self, key: K, value: V) {
        if self.map.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push_back(key);
        if self.map.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.order.retain(|stored| stored != key);
        self.map.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub const fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub const fn misses(&self) -> u64 {
        self.misses
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|stored| stored == key) {
            if let Some(entry) = self.order.remove(pos) {
                self.order.push_back(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_replaces_on_equal_key() {
        let map: OperationsMap<String, i32> = OperationsMap::new(CollectionStrategy::Unordered);
        map.put("a".to_string(), 1);
        map.put("a".to_string(), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"a".to_string()), Some(2));
    }

    #[test]
    fn test_custom_equality() {
        // Case-insensitive keys: extractor hashes the lowered form.
        let map: OperationsMap<String, i32> = OperationsMap::with_key_fns(
            CollectionStrategy::InsertionOrdered,
            Arc::new(|key: &String| {
                let mut hasher = DefaultHasher::new();
                key.to_lowercase().hash(&mut hasher);
                hasher.finish()
            }),
            Arc::new(|a: &String, b: &String| a.to_lowercase() == b.to_lowercase()),
        );
        map.put("Users".to_string(), 1);
        map.put("USERS".to_string(), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"users".to_string()), Some(2));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let map: OperationsMap<i32, i32> =
            OperationsMap::new(CollectionStrategy::InsertionOrdered);
        for i in 0..5 {
            map.put(i, i * 10);
        }
        map.remove(&2);
        let keys: Vec<i32> = map.items().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_metrics_count_operations() {
        let map: OperationsMap<i32, i32> = OperationsMap::new(CollectionStrategy::Unordered);
        map.put(1, 1);
        let _unused = map.get(&1);
        let _unused = map.get(&2);
        assert_eq!(map.metrics().operation_count, 3);
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        // Reading `a` protects it; `b` becomes the eviction victim.
        assert_eq!(cache.get(&"a"), Some(1));
        cache.put("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn test_lru_counters() {
        let mut cache = LruCache::new(4);
        cache.put(1, 1);
        let _unused = cache.get(&1);
        let _unused = cache.get(&9);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }
}
