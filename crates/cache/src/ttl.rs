use std::hash::Hash;

use ahash::AHashMap;

#[derive(Debug, Clone)]
struct Stamped<V> {
    value: V,
    stamp: u64,
}

/// Map whose entries expire `ttl_ms` after their stamp.
///
/// Expired entries are removed by [`TtlMap::sweep`]. Inserting into a full
/// map sweeps first and then evicts the entry with the oldest stamp.
#[derive(Debug, Clone)]
pub struct TtlMap<K, V> {
    entries: AHashMap<K, Stamped<V>>,
    ttl_ms: u64,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> TtlMap<K, V> {
    pub fn new(ttl_ms: u64, capacity: usize) -> Self {
        Self {
            entries: AHashMap::new(),
            ttl_ms,
            capacity: capacity.max(1),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert or replace, stamping the entry with `now`.
    pub fn insert(&mut self, key: K, value: V, now: u64) -> Option<V> {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.make_room(now);
        }
        self.entries
            .insert(key, Stamped { value, stamp: now })
            .map(|old| old.value)
    }

    /// Existing entry, or a fresh one from `make`. Either way the stamp is
    /// refreshed to `now`.
    pub fn touch_or_insert_with(&mut self, key: K, now: u64, make: impl FnOnce() -> V) -> &mut V {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.make_room(now);
        }
        let slot = self.entries.entry(key).or_insert_with(|| Stamped {
            value: make(),
            stamp: now,
        });
        slot.stamp = now;
        &mut slot.value
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|s| &s.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|s| &mut s.value)
    }

    pub fn stamp(&self, key: &K) -> Option<u64> {
        self.entries.get(key).map(|s| s.stamp)
    }

    /// Refresh the stamp. Returns false if the key is absent.
    pub fn touch(&mut self, key: &K, now: u64) -> bool {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.stamp = now;
                true
            }
            None => false,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_expired(&self, key: &K, now: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|s| now.saturating_sub(s.stamp) > self.ttl_ms)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|s| s.value)
    }

    /// Remove and return every entry older than the TTL.
    pub fn sweep(&mut self, now: u64) -> Vec<(K, V)> {
        let ttl = self.ttl_ms;
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.stamp) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|s| (k, s.value)))
            .collect()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        self.entries.retain(|k, s| keep(k, &s.value));
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, s)| (k, &s.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn make_room(&mut self, now: u64) {
        let swept = self.sweep(now).len();
        if swept > 0 {
            tracing::trace!(swept, "ttl map swept on insert");
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, s)| s.stamp)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            tracing::trace!(capacity = self.capacity, "ttl map evicted oldest entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_ttl() {
        let mut map = TtlMap::new(1_000, 16);
        map.insert("a", 1, 0);
        map.insert("b", 2, 500);

        assert!(map.sweep(1_000).is_empty());
        let expired = map.sweep(1_001);
        assert_eq!(expired, vec![("a", 1)]);
        assert_eq!(map.len(), 1);
        assert!(map.is_expired(&"b", 1_501));
        assert!(!map.is_expired(&"b", 1_500));
    }

    #[test]
    fn touch_extends_lifetime() {
        let mut map = TtlMap::new(100, 16);
        map.insert(1, "x", 0);
        assert!(map.touch(&1, 90));
        assert!(map.sweep(150).is_empty());
        assert!(!map.touch(&2, 90));
    }

    #[test]
    fn touch_or_insert_creates_then_updates() {
        let mut map: TtlMap<&str, u32> = TtlMap::new(100, 16);
        *map.touch_or_insert_with("k", 0, || 0) += 1;
        *map.touch_or_insert_with("k", 50, || 0) += 1;
        assert_eq!(map.get(&"k"), Some(&2));
        assert_eq!(map.stamp(&"k"), Some(50));
    }

    #[test]
    fn full_map_evicts_oldest() {
        let mut map = TtlMap::new(10_000, 2);
        map.insert("old", 1, 0);
        map.insert("mid", 2, 10);
        map.insert("new", 3, 20);
        assert_eq!(map.len(), 2);
        assert!(!map.contains_key(&"old"));
        assert!(map.contains_key(&"new"));
    }

    #[test]
    fn full_map_prefers_sweeping_expired() {
        let mut map = TtlMap::new(100, 2);
        map.insert("stale", 1, 0);
        map.insert("fresh", 2, 150);
        map.insert("next", 3, 160);
        assert!(map.contains_key(&"fresh"));
        assert!(map.contains_key(&"next"));
        assert!(!map.contains_key(&"stale"));
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let mut map = TtlMap::new(10_000, 1);
        map.insert("a", 1, 0);
        assert_eq!(map.insert("a", 2, 5), Some(1));
        assert_eq!(map.len(), 1);
    }
}
