use std::hash::Hash;

use ahash::AHashMap;

/// Per-key future deadlines, e.g. exemption windows and cooldowns.
///
/// A key is active while `now < deadline`. Elapsed keys are dropped by
/// [`DeadlineMap::sweep`] or lazily when queried through
/// [`DeadlineMap::check`].
#[derive(Debug, Clone)]
pub struct DeadlineMap<K> {
    deadlines: AHashMap<K, u64>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> DeadlineMap<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            deadlines: AHashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Set or replace the deadline for `key`.
    ///
    /// A full map first drops elapsed entries, then the entry expiring soonest.
    pub fn set(&mut self, key: K, deadline: u64, now: u64) {
        if !self.deadlines.contains_key(&key) && self.deadlines.len() >= self.capacity {
            self.sweep(now);
            if self.deadlines.len() >= self.capacity {
                let soonest = self
                    .deadlines
                    .iter()
                    .min_by_key(|(_, d)| **d)
                    .map(|(k, _)| k.clone());
                if let Some(k) = soonest {
                    self.deadlines.remove(&k);
                }
            }
        }
        self.deadlines.insert(key, deadline);
    }

    pub fn is_active(&self, key: &K, now: u64) -> bool {
        self.deadlines.get(key).is_some_and(|d| now < *d)
    }

    /// Like [`DeadlineMap::is_active`], but removes the key once elapsed.
    pub fn check(&mut self, key: &K, now: u64) -> bool {
        match self.deadlines.get(key) {
            Some(d) if now < *d => true,
            Some(_) => {
                self.deadlines.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn deadline(&self, key: &K) -> Option<u64> {
        self.deadlines.get(key).copied()
    }

    pub fn remove(&mut self, key: &K) -> Option<u64> {
        self.deadlines.remove(key)
    }

    /// Drop every elapsed deadline. Returns how many were removed.
    pub fn sweep(&mut self, now: u64) -> usize {
        let before = self.deadlines.len();
        self.deadlines.retain(|_, d| now < *d);
        before - self.deadlines.len()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.deadlines.retain(|k, _| keep(k));
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}
