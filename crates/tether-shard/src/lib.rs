//! # tether-shard
//!
//! A concurrent map split into independently locked shards.
//!
//! Keys are routed to shards with a fixed-key hasher, so the same key always
//! lands in the same shard (in every process, not just this one). Each shard
//! is a `parking_lot::RwLock<HashMap>`; writers only contend with readers of
//! the same shard.
//!
//! [`ShardedMap::for_each`] never holds more than one shard lock at a time and
//! releases it before running the visitor, so visitors are free to call back
//! into the map.

#![deny(unsafe_code)]

use std::borrow::Borrow;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

/// Smallest number of shards a map is built with.
pub const MIN_SHARDS: usize = 2;

/// Deterministic shard index for `key` among `shards` shards.
///
/// `shards` of zero is treated as one.
#[allow(clippy::cast_possible_truncation)]
pub fn shard_index<Q: Hash + ?Sized>(key: &Q, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// A map partitioned into `N` independently locked shards.
pub struct ShardedMap<K, V> {
    shards: Box<[RwLock<HashMap<K, V>>]>,
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash,
{
    /// Create a map with `shards` shards (at least [`MIN_SHARDS`]).
    pub fn new(shards: usize) -> Self {
        let count = shards.max(MIN_SHARDS);
        let shards = (0..count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    fn shard<Q>(&self, key: &Q) -> &RwLock<HashMap<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        &self.shards[shard_index(key, self.shards.len())]
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Insert a value, returning the previous value for the key, if any.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    /// Remove a key, returning its value.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).write().remove(key)
    }

    /// Remove a key only if `predicate` holds for its current value.
    ///
    /// The check and the removal happen under the same shard lock.
    pub fn remove_if<Q>(&self, key: &Q, predicate: impl FnOnce(&V) -> bool) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut shard = self.shard(key).write();
        if shard.get(key).is_some_and(predicate) {
            shard.remove(key)
        } else {
            None
        }
    }

    /// Total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Whether every shard is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Clone out the value for a key.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).read().get(key).cloned()
    }

    /// Visit every entry.
    ///
    /// Shards are visited one after another. Each shard is read-locked only
    /// while its entries are copied out; the visitor runs with no lock held.
    /// Entries inserted or removed concurrently may or may not be visited.
    pub fn for_each(&self, mut visitor: impl FnMut(&K, &V)) {
        for shard in &*self.shards {
            let snapshot: Vec<(K, V)> = shard
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (key, value) in &snapshot {
                visitor(key, value);
            }
        }
    }
}

impl<K, V> Default for ShardedMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn shard_count_has_floor() {
        let map: ShardedMap<String, u32> = ShardedMap::new(1);
        assert_eq!(map.shard_count(), 2);
        let map: ShardedMap<String, u32> = ShardedMap::new(0);
        assert_eq!(map.shard_count(), 2);
        let map: ShardedMap<String, u32> = ShardedMap::new(20);
        assert_eq!(map.shard_count(), 20);
    }

    #[test]
    fn shard_index_is_deterministic() {
        let a = shard_index("conn-42", 16);
        let b = shard_index("conn-42", 16);
        assert_eq!(a, b);
        assert!(a < 16);
    }

    #[test]
    fn shard_index_spreads_keys() {
        let mut counts = [0usize; 8];
        for i in 0..8_000 {
            counts[shard_index(&format!("key-{i}"), 8)] += 1;
        }
        // Every shard gets a reasonable share of 1000 expected keys.
        for count in counts {
            assert!(count > 700, "uneven distribution: {counts:?}");
        }
    }

    #[test]
    fn insert_get_remove() {
        let map = ShardedMap::new(4);
        assert!(map.insert("a".to_string(), 1).is_none());
        assert_eq!(map.get("a"), Some(1));
        assert_eq!(map.remove("a"), Some(1));
        assert!(map.get("a").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn insert_duplicate_overwrites() {
        let map = ShardedMap::new(4);
        let _ = map.insert("same".to_string(), 1);
        assert_eq!(map.insert("same".to_string(), 2), Some(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("same"), Some(2));
    }

    #[test]
    fn remove_missing_key() {
        let map: ShardedMap<String, u32> = ShardedMap::new(4);
        assert!(map.remove("nope").is_none());
    }

    #[test]
    fn remove_if_checks_value() {
        let map = ShardedMap::new(4);
        let _ = map.insert("k".to_string(), 7);
        assert!(map.remove_if("k", |v| *v == 8).is_none());
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove_if("k", |v| *v == 7), Some(7));
        assert!(map.is_empty());
    }

    #[test]
    fn len_counts_all_shards() {
        let map = ShardedMap::new(3);
        for i in 0..100 {
            let _ = map.insert(i, i * 2);
        }
        assert_eq!(map.len(), 100);
        let mut visited = 0;
        map.for_each(|_, _| visited += 1);
        assert_eq!(visited, 100);
    }

    #[test]
    fn for_each_visits_everything() {
        let map = ShardedMap::new(4);
        for i in 0..50u32 {
            let _ = map.insert(i, i);
        }
        let mut sum = 0;
        map.for_each(|_, v| sum += v);
        assert_eq!(sum, (0..50).sum::<u32>());
    }

    #[test]
    fn visitor_may_mutate_map() {
        let map = ShardedMap::new(2);
        for i in 0..20u32 {
            let _ = map.insert(i, i);
        }
        map.for_each(|k, _| {
            let _ = map.remove(k);
            let _ = map.get(&(k + 1));
        });
        assert!(map.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_churn_during_iteration() {
        let map = Arc::new(ShardedMap::new(8));
        for i in 0..1_000u32 {
            let _ = map.insert(i, Arc::new(i));
        }

        let writer = {
            let map = map.clone();
            tokio::spawn(async move {
                for i in 0..1_000u32 {
                    let _ = map.remove(&i);
                    let _ = map.insert(i + 1_000, Arc::new(i + 1_000));
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..10 {
            map.for_each(|k, v| assert_eq!(*k, **v));
            tokio::task::yield_now().await;
        }

        writer.await.unwrap();
        assert_eq!(map.len(), 1_000);
    }
}
