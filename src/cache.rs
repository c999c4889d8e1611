//! Sharded LRU cache with charge-based eviction.
//!
//! One cache instance serves many files: the block cache is keyed by
//! `(cache_id, block_offset)` where each open table draws a fresh
//! `cache_id`, and the table cache is keyed by file number. Entries are
//! shared out as `Arc`s, so eviction never invalidates a value a reader
//! is still holding — it only drops the cache's own reference.
//!
//! The key space is split across 16 shards by hash; each shard has its
//! own lock and its own recency order, which keeps writer contention
//! localized. Within a shard, recency is tracked by a queue of
//! `(key, generation)` stamps with lazy invalidation: each access
//! pushes a fresh stamp, and eviction pops stamps until it finds one
//! that is still current.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

const NUM_SHARD_BITS: usize = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

// ------------------------------------------------------------------------------------------------
// Shard
// ------------------------------------------------------------------------------------------------

struct Entry<V> {
    value: Arc<V>,
    charge: usize,
    /// Stamp of this entry's newest position in the recency queue.
    generation: u64,
}

struct Shard<K, V> {
    capacity: usize,
    usage: usize,
    map: HashMap<K, Entry<V>>,
    /// Recency stamps, oldest first; stale stamps are skipped on pop.
    recency: VecDeque<(K, u64)>,
    next_generation: u64,
}

impl<K: Hash + Eq + Clone, V> Shard<K, V> {
    fn new(capacity: usize) -> Shard<K, V> {
        Shard {
            capacity,
            usage: 0,
            map: HashMap::new(),
            recency: VecDeque::new(),
            next_generation: 0,
        }
    }

    fn touch(&mut self, key: &K) {
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(entry) = self.map.get_mut(key) {
            entry.generation = generation;
            self.recency.push_back((key.clone(), generation));
        }
        // Keep the stamp queue from outgrowing the live set when reads
        // dominate: drop stale stamps once they are the majority.
        if self.recency.len() > 4 * self.map.len().max(16) {
            let map = &self.map;
            self.recency
                .retain(|(k, generation)| map.get(k).is_some_and(|e| e.generation == *generation));
        }
    }

    fn lookup(&mut self, key: &K) -> Option<Arc<V>> {
        let value = self.map.get(key).map(|e| Arc::clone(&e.value))?;
        self.touch(key);
        Some(value)
    }

    fn insert(&mut self, key: K, value: Arc<V>, charge: usize) {
        if let Some(old) = self.map.remove(&key) {
            self.usage -= old.charge;
        }
        self.usage += charge;
        self.map.insert(
            key.clone(),
            Entry {
                value,
                charge,
                generation: 0,
            },
        );
        self.touch(&key);
        self.evict();
    }

    fn erase(&mut self, key: &K) {
        if let Some(old) = self.map.remove(key) {
            self.usage -= old.charge;
        }
    }

    fn evict(&mut self) {
        while self.usage > self.capacity {
            let Some((key, generation)) = self.recency.pop_front() else {
                return;
            };
            let is_current = self
                .map
                .get(&key)
                .is_some_and(|e| e.generation == generation);
            if is_current {
                if let Some(old) = self.map.remove(&key) {
                    self.usage -= old.charge;
                    trace!(charge = old.charge, "cache entry evicted");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Sharded cache
// ------------------------------------------------------------------------------------------------

/// Thread-safe LRU cache; see the module docs for the sharding scheme.
pub struct ShardedCache<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
    next_id: AtomicU64,
}

impl<K: Hash + Eq + Clone, V> ShardedCache<K, V> {
    /// A cache bounded by `capacity` total charge.
    pub fn new(capacity: usize) -> ShardedCache<K, V> {
        let per_shard = capacity.div_ceil(NUM_SHARDS);
        ShardedCache {
            shards: (0..NUM_SHARDS)
                .map(|_| Mutex::new(Shard::new(per_shard)))
                .collect(),
            next_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() >> (64 - NUM_SHARD_BITS)) as usize;
        &self.shards[index]
    }

    /// Insert `value` under `key`, accounting `charge` bytes against the
    /// capacity. Replaces any previous entry for `key`.
    pub fn insert(&self, key: K, value: Arc<V>, charge: usize) {
        self.shard(&key).lock().unwrap().insert(key, value, charge);
    }

    /// Fetch the entry for `key`, refreshing its recency.
    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key).lock().unwrap().lookup(key)
    }

    /// Drop the entry for `key`, if present.
    pub fn erase(&self, key: &K) {
        self.shard(key).lock().unwrap().erase(key);
    }

    /// A fresh id for partitioning one cache among many users.
    pub fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Total charge currently held, across shards.
    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().usage).sum()
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
