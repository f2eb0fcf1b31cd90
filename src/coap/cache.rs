//! A content-addressed serialization cache. The same RPC request is
//! frequently re-serialized for multiple peers and retransmissions; the
//! cache memoizes the encoded bytes, keyed by the request itself.
//!
//! Correctness relies on content addressing: entries are matched by full
//! key equality, so an identical logical request always yields identical
//! cached bytes, and eviction can only cause a miss, never a wrong result.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use itertools::Itertools as _;

struct CacheEntry {
    bytes: Vec<u8>,
    last_access: Instant,
}

/// A serialization cache with TTL and capacity eviction. Keys are the
/// logical values being serialized (hashed and compared by value); entries
/// hold their encoded bytes.
pub struct SerializationCache<K> {
    entries: HashMap<K, CacheEntry>,
    capacity: usize,
    ttl: Duration,
    hits: u64,
    misses: u64,
}

impl<K: Clone + Eq + Hash> SerializationCache<K> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { entries: HashMap::new(), capacity, ttl, hits: 0, misses: 0 }
    }

    /// Returns the cached encoding of the given key, if present and fresh.
    pub fn get(&mut self, key: &K) -> Option<Vec<u8>> {
        match self.entries.get_mut(key) {
            Some(entry) if entry.last_access.elapsed() <= self.ttl => {
                entry.last_access = Instant::now();
                self.hits += 1;
                Some(entry.bytes.clone())
            }
            Some(_) => {
                // Expired; drop it and report a miss.
                self.entries.remove(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Caches the encoding of the given key, evicting the least recently
    /// accessed entry if at capacity. A zero capacity disables the cache.
    pub fn insert(&mut self, key: K, bytes: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) =
                self.entries.iter().min_by_key(|(_, e)| e.last_access).map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, CacheEntry { bytes, last_access: Instant::now() });
    }

    /// Returns the cached encoding, or computes, caches, and returns it.
    pub fn get_or_insert_with(&mut self, key: &K, encode: impl FnOnce() -> Vec<u8>) -> Vec<u8> {
        if let Some(bytes) = self.get(key) {
            return bytes;
        }
        let bytes = encode();
        self.insert(key.clone(), bytes.clone());
        bytes
    }

    /// Evicts entries past their TTL, then trims to capacity oldest-first.
    /// Returns the number evicted.
    pub fn cleanup(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.last_access.elapsed() <= ttl);
        if self.entries.len() > self.capacity {
            let excess = self.entries.len() - self.capacity;
            let evict: Vec<K> = self
                .entries
                .iter()
                .sorted_by_key(|(_, e)| e.last_access)
                .take(excess)
                .map(|(k, _)| k.clone())
                .collect();
            for key in evict {
                self.entries.remove(&key);
            }
        }
        before - self.entries.len()
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the hit and miss counts.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn content_addressed_hits() {
        let mut cache = SerializationCache::new(10, Duration::from_secs(60));
        assert_eq!(cache.get(&"a"), None);
        cache.insert("a", vec![1, 2, 3]);
        // An identical key always yields the identical cached bytes.
        assert_eq!(cache.get(&"a"), Some(vec![1, 2, 3]));
        assert_eq!(cache.get(&"a"), Some(vec![1, 2, 3]));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.stats(), (2, 2));
    }

    #[test]
    fn get_or_insert_encodes_once() {
        let mut cache = SerializationCache::new(10, Duration::from_secs(60));
        let mut encodes = 0;
        for _ in 0..3 {
            let bytes = cache.get_or_insert_with(&"key", || {
                encodes += 1;
                vec![0xab]
            });
            assert_eq!(bytes, vec![0xab]);
        }
        assert_eq!(encodes, 1);
    }

    #[test]
    fn eviction_causes_misses_not_wrong_results() {
        // With capacity 2, inserting a third entry evicts the least
        // recently accessed one. The evicted key misses; it never returns
        // another key's bytes.
        let mut cache = SerializationCache::new(2, Duration::from_secs(60));
        cache.insert("a", vec![1]);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b", vec![2]);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(&"a"), Some(vec![1])); // refresh "a"
        cache.insert("c", vec![3]); // evicts "b"
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(vec![1]));
        assert_eq!(cache.get(&"c"), Some(vec![3]));
    }

    #[test]
    fn ttl_expiry() {
        let mut cache = SerializationCache::new(10, Duration::from_millis(1));
        cache.insert("a", vec![1]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"a"), None);
        cache.insert("b", vec![2]);
        assert_eq!(cache.cleanup(), 0); // "b" is fresh, "a" already dropped
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.cleanup(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let mut cache = SerializationCache::new(0, Duration::from_secs(60));
        cache.insert("a", vec![1]);
        assert_eq!(cache.get(&"a"), None);
    }
}
