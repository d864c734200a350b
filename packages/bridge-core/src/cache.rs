//! Bounded least-recently-used cache for proof bundles and stored proofs.
//!
//! Proofs never go stale once their block is final, so there is no TTL; the
//! only eviction is by capacity, dropping the entry that was touched longest
//! ago.
//!
//! ## Sizing
//!
//! - A claim bundle is dominated by the encoded header and storage proof,
//!   typically 2-6 KB, so the default 1024 entries stay under ~6 MB.

use std::collections::HashMap;
use std::hash::Hash;

pub const DEFAULT_PROOF_CACHE_SIZE: usize = 1024;

pub struct BoundedCache<K, V> {
    map: HashMap<K, (V, u64)>,
    max_size: usize,
    tick: u64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(max_size: usize) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up an entry and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        self.map.get_mut(key).map(|(v, t)| {
            *t = tick;
            &*v
        })
    }

    /// Look up an entry without touching its recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|(v, _)| v)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Insert or replace. Evicts the least recently used entries when full.
    pub fn insert(&mut self, key: K, value: V) {
        if !self.map.contains_key(&key) {
            while self.map.len() >= self.max_size {
                let oldest = self
                    .map
                    .iter()
                    .min_by_key(|(_, (_, t))| *t)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        self.map.remove(&k);
                    }
                    None => break,
                }
            }
        }
        let tick = self.next_tick();
        self.map.insert(key, (value, tick));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
