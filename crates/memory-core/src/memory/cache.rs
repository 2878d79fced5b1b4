//! Bounded TTL cache used for record lookups and repeated queries.
//!
//! Entries expire `ttl` after insertion. When full, the oldest insertion is
//! evicted. A cache hit is always a value that was correct when inserted;
//! callers flush on mutations that could make it stale.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted: Instant,
    seq: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Insertion order; may contain keys already evicted or overwritten
    order: VecDeque<(K, u64)>,
    next_seq: u64,
}

pub struct TtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 || self.ttl.is_zero() {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if !inner.entries.contains_key(&key) {
            while inner.entries.len() >= self.capacity {
                let Some((old, old_seq)) = inner.order.pop_front() else {
                    break;
                };
                // Skip stale order entries left behind by overwrites
                if inner.entries.get(&old).map(|e| e.seq) == Some(old_seq) {
                    inner.entries.remove(&old);
                }
            }
        }

        inner.order.push_back((key.clone(), seq));
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
                seq,
            },
        );

        // Keep the order queue from growing without bound under overwrites
        if inner.order.len() > self.capacity.saturating_mul(2) {
            let Inner { entries, order, .. } = &mut *inner;
            order.retain(|(k, seq)| entries.get(k).map(|e| e.seq) == Some(*seq));
        }
    }

    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_insert() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        assert_eq!(cache.get(&1), None);
        cache.insert(1, "one".to_string());
        assert_eq!(cache.get(&1), Some("one".to_string()));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(1, 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(10));

        // Key 2 is now the oldest live insertion
        cache.insert(3, 3);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
    }

    #[test]
    fn test_expiry() {
        let cache = TtlCache::new(4, Duration::from_millis(20));
        cache.insert("k", 1);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert(1, 1);
        cache.clear();
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = TtlCache::new(0, Duration::from_secs(60));
        cache.insert(1, 1);
        assert_eq!(cache.get(&1), None);
    }
}
