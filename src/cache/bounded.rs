//! Bounded insertion-ordered map
//!
//! Backs the obfuscator's name caches: a plain map with a capacity cap that
//! evicts the oldest-inserted entry once full. Purely a performance layer,
//! never a source of truth.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Capacity-capped map, oldest-inserted entry evicted first
pub struct BoundedMap<K: Clone + Eq + Hash, V> {
    capacity: usize,
    map: HashMap<K, V>,
    /// Insertion order (front = oldest)
    order: VecDeque<K>,
}

impl<K: Clone + Eq + Hash, V> BoundedMap<K, V> {
    /// Create with a fixed capacity. Zero capacity disables caching.
    pub fn new(capacity: usize) -> Self {
        BoundedMap {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Insert, evicting the oldest entry if at capacity. Re-inserting an
    /// existing key replaces the value without changing its age.
    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            while self.map.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache = BoundedMap::new(4);
        cache.insert("a", 1);
        cache.insert("b", 2);

        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.get(&"c"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let mut cache = BoundedMap::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.get(&"c"), Some(&3));
    }

    #[test]
    fn test_reinsert_replaces_value() {
        let mut cache = BoundedMap::new(2);
        cache.insert("a", 1);
        cache.insert("a", 9);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(&9));
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let mut cache = BoundedMap::new(0);
        cache.insert("a", 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut cache = BoundedMap::new(4);
        cache.insert("a", 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"a"), None);
    }
}
