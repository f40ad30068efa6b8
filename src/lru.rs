//! Bounded LRU map with TTL-based invisibility.
//!
//! Entries older than the TTL are invisible to `get` even before they are
//! evicted; capacity eviction is amortized O(1) via a recency queue with
//! lazy deletion. Not thread-safe on its own; callers wrap it in a lock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Hit/miss counters for a cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Fresh,
    Expired,
    Missing,
}

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    inserted_at: DateTime<Utc>,
    /// Recency sequence; stale queue entries with older sequences are skipped.
    seq: u64,
}

/// LRU map with per-entry TTL.
#[derive(Debug)]
pub struct LruTtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    map: HashMap<K, Slot<V>>,
    order: VecDeque<(K, u64)>,
    next_seq: u64,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash + Clone, V> LruTtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            map: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a live entry, bumping its recency.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let now = Utc::now();
        let state = match self.map.get(key) {
            Some(slot) if now - slot.inserted_at < self.ttl => Lookup::Fresh,
            Some(_) => Lookup::Expired,
            None => Lookup::Missing,
        };

        if state == Lookup::Expired {
            // Expired but not yet evicted: invisible to callers.
            self.map.remove(key);
        }
        if state != Lookup::Fresh {
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        let seq = self.bump_seq();
        let slot = self.map.get_mut(key).expect("slot checked above");
        slot.seq = seq;
        self.order.push_back((key.clone(), seq));
        Some(&self.map[key].value)
    }

    /// Insert or replace an entry, evicting the least-recent on overflow.
    pub fn insert(&mut self, key: K, value: V) {
        let seq = self.bump_seq();
        self.map.insert(
            key.clone(),
            Slot {
                value,
                inserted_at: Utc::now(),
                seq,
            },
        );
        self.order.push_back((key, seq));

        while self.map.len() > self.capacity {
            self.evict_one();
        }
    }

    /// Number of retained entries, expired ones included.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate live (unexpired) entries without bumping recency.
    pub fn iter_live(&self) -> impl Iterator<Item = (&K, &V)> {
        let now = Utc::now();
        let ttl = self.ttl;
        self.map.iter().filter_map(move |(k, slot)| {
            (now - slot.inserted_at < ttl).then_some((k, &slot.value))
        })
    }

    /// Number of live (unexpired) entries.
    pub fn live_len(&self) -> usize {
        self.iter_live().count()
    }

    /// Drop entries past their TTL.
    pub fn purge_expired(&mut self) {
        let now = Utc::now();
        let ttl = self.ttl;
        self.map.retain(|_, slot| now - slot.inserted_at < ttl);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.map.len(),
        }
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn evict_one(&mut self) {
        while let Some((key, seq)) = self.order.pop_front() {
            // Skip queue entries superseded by a later access.
            let live = self.map.get(&key).map(|slot| slot.seq == seq);
            if live == Some(true) {
                self.map.remove(&key);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> LruTtlCache<String, u32> {
        LruTtlCache::new(capacity, Duration::minutes(5))
    }

    #[test]
    fn test_basic_get_insert() {
        let mut c = cache(10);
        c.insert("a".into(), 1);
        assert_eq!(c.get(&"a".to_string()), Some(&1));
        assert_eq!(c.get(&"b".to_string()), None);

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let mut c = cache(2);
        c.insert("a".into(), 1);
        c.insert("b".into(), 2);

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(c.get(&"a".to_string()).is_some());
        c.insert("c".into(), 3);

        assert_eq!(c.len(), 2);
        assert!(c.get(&"a".to_string()).is_some());
        assert!(c.get(&"b".to_string()).is_none());
        assert!(c.get(&"c".to_string()).is_some());
    }

    #[test]
    fn test_expired_entries_invisible() {
        let mut c: LruTtlCache<String, u32> = LruTtlCache::new(10, Duration::zero());
        c.insert("a".into(), 1);
        assert_eq!(c.get(&"a".to_string()), None);
    }

    #[test]
    fn test_purge_expired() {
        let mut c: LruTtlCache<String, u32> = LruTtlCache::new(10, Duration::zero());
        c.insert("a".into(), 1);
        c.insert("b".into(), 2);
        assert_eq!(c.len(), 2);

        c.purge_expired();
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_replace_does_not_grow() {
        let mut c = cache(2);
        c.insert("a".into(), 1);
        c.insert("a".into(), 2);
        c.insert("a".into(), 3);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(&"a".to_string()), Some(&3));
    }
}
