//! Sharded Connection Table
//!
//! Concurrent id -> entry map split across a fixed number of shards.
//!
//! # Design
//!
//! - Each shard has its own RwLock, so lookups on different connections
//!   rarely contend
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Refresh and conditional removal both run under the shard write lock,
//!   which makes "check idle, then remove" atomic against a lookup

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

/// Single shard
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn insert(&self, key: K, value: V) -> Option<V> {
        self.map.write().insert(key, value)
    }

    fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.map.write().get_mut(key).map(f)
    }

    fn get_with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.map.read().get(key).map(f)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.map.write().remove(key)
    }

    fn drain_where(&self, mut pred: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)>
    where
        K: Clone,
    {
        let mut guard = self.map.write();
        let keys: Vec<K> = guard
            .iter()
            .filter(|(k, v)| pred(*k, *v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| guard.remove(&k).map(|v| (k, v)))
            .collect()
    }

    fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.map.read().keys().cloned().collect()
    }
}

/// Sharded map with a compile-time shard count (power of two)
pub struct ShardedMap<K, V, const N: usize = 16> {
    shards: Box<[Shard<K, V>]>,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    pub fn new() -> Self {
        debug_assert!(N.is_power_of_two());
        Self {
            shards: (0..N).map(|_| Shard::default()).collect(),
        }
    }
}

impl<K: Eq + Hash, V, const N: usize> ShardedMap<K, V, N> {
    #[inline]
    fn shard(&self, key: &K) -> &Shard<K, V> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).insert(key, value)
    }

    /// Mutate an entry in place under its shard's write lock
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.shard(key).update(key, f)
    }

    /// Inspect an entry under its shard's read lock
    pub fn get_with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard(key).get_with(key, f)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get_with(key, |_| ()).is_some()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).remove(key)
    }

    /// Remove and return every entry matching `pred`.
    ///
    /// The predicate runs under the write lock of the entry's shard, so no
    /// `update` on that entry can interleave between check and removal.
    pub fn drain_where(&self, mut pred: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)>
    where
        K: Clone,
    {
        self.shards
            .iter()
            .flat_map(|shard| shard.drain_where(&mut pred))
            .collect()
    }

    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.shards.iter().flat_map(|s| s.keys()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
