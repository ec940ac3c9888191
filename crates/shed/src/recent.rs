use std::sync::Arc;

use ballast_cache::BoundedLru;
use ballast_common::{Clock, ObjectId, RegionId, SpatialKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentConfig {
    /// How long an action counts as recent.
    pub retention_ms: u64,
    pub capacity: usize,
    pub sweep_period_ms: u64,
}

impl Default for RecentConfig {
    fn default() -> Self {
        Self {
            retention_ms: 30_000,
            capacity: 5_000,
            sweep_period_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecentStats {
    pub placements: usize,
    pub dispenses: usize,
    pub spawns: usize,
}

/// Short memory of player-driven actions.
///
/// Limiters use it to tell deliberate player activity from runaway
/// machinery.
pub struct RecentActionTracker {
    config: RecentConfig,
    clock: Arc<dyn Clock>,
    placements: Mutex<BoundedLru<SpatialKey, u64>>,
    dispenses: Mutex<BoundedLru<SpatialKey, u64>>,
    spawns: Mutex<BoundedLru<ObjectId, u64>>,
}

impl RecentActionTracker {
    pub fn new(config: RecentConfig, clock: Arc<dyn Clock>) -> Self {
        let cap = config.capacity;
        Self {
            config,
            clock,
            placements: Mutex::new(BoundedLru::new(cap)),
            dispenses: Mutex::new(BoundedLru::new(cap)),
            spawns: Mutex::new(BoundedLru::new(cap)),
        }
    }

    pub fn config(&self) -> &RecentConfig {
        &self.config
    }

    pub fn record_placement(&self, key: &SpatialKey) {
        self.placements.lock().put(key.clone(), self.clock.now_ms());
    }

    pub fn record_dispense(&self, key: &SpatialKey) {
        self.dispenses.lock().put(key.clone(), self.clock.now_ms());
    }

    /// Remember an object a player created directly.
    pub fn record_player_spawn(&self, id: ObjectId) {
        self.spawns.lock().put(id, self.clock.now_ms());
    }

    pub fn placed_recently(&self, key: &SpatialKey) -> bool {
        let stamp = self.placements.lock().get(key).copied();
        self.is_recent(stamp)
    }

    pub fn dispensed_recently(&self, key: &SpatialKey) -> bool {
        let stamp = self.dispenses.lock().get(key).copied();
        self.is_recent(stamp)
    }

    pub fn spawned_by_player(&self, id: ObjectId) -> bool {
        let stamp = self.spawns.lock().get(&id).copied();
        self.is_recent(stamp)
    }

    fn is_recent(&self, stamp: Option<u64>) -> bool {
        stamp.is_some_and(|t| self.clock.now_ms().saturating_sub(t) < self.config.retention_ms)
    }

    /// Drop entries older than `max(10s, 2 * retention)`.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let cutoff = (2 * self.config.retention_ms).max(10_000);
        let keep = |_: &SpatialKey, t: &u64| now.saturating_sub(*t) <= cutoff;
        self.placements.lock().retain(keep)
            + self.dispenses.lock().retain(keep)
            + self.spawns.lock().retain(|_, t| now.saturating_sub(*t) <= cutoff)
    }

    pub fn clear_region(&self, region: &RegionId) {
        self.placements.lock().retain(|k, _| k.region() != region);
        self.dispenses.lock().retain(|k, _| k.region() != region);
    }

    pub fn clear(&self) {
        self.placements.lock().clear();
        self.dispenses.lock().clear();
        self.spawns.lock().clear();
    }

    pub fn stats(&self) -> RecentStats {
        RecentStats {
            placements: self.placements.lock().len(),
            dispenses: self.dispenses.lock().len(),
            spawns: self.spawns.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_common::ManualClock;

    fn tracker(clock: Arc<ManualClock>) -> RecentActionTracker {
        RecentActionTracker::new(RecentConfig::default(), clock)
    }

    #[test]
    fn actions_are_recent_within_retention() {
        let clock = Arc::new(ManualClock::new(0));
        let t = tracker(clock.clone());
        let key = SpatialKey::at(4, 64, 4);
        t.record_placement(&key);
        assert!(t.placed_recently(&key));
        assert!(!t.dispensed_recently(&key));

        clock.set(29_999);
        assert!(t.placed_recently(&key));
        clock.set(30_000);
        assert!(!t.placed_recently(&key));
    }

    #[test]
    fn sweep_uses_doubled_retention() {
        let clock = Arc::new(ManualClock::new(0));
        let t = tracker(clock.clone());
        let id = ObjectId::new();
        t.record_player_spawn(id);
        t.record_dispense(&SpatialKey::at(0, 0, 0));

        clock.set(60_000);
        assert_eq!(t.sweep(), 0);
        clock.set(60_001);
        assert_eq!(t.sweep(), 2);
        assert_eq!(t.stats(), RecentStats::default());
    }

    #[test]
    fn capacity_bounds_each_map() {
        let clock = Arc::new(ManualClock::new(0));
        let t = RecentActionTracker::new(
            RecentConfig {
                capacity: 8,
                ..RecentConfig::default()
            },
            clock,
        );
        for x in 0..50 {
            t.record_placement(&SpatialKey::at(x, 0, 0));
        }
        assert_eq!(t.stats().placements, 8);
        assert!(t.placed_recently(&SpatialKey::at(49, 0, 0)));
        assert!(!t.placed_recently(&SpatialKey::at(0, 0, 0)));
    }

    #[test]
    fn clear_region_spares_other_regions() {
        let clock = Arc::new(ManualClock::new(0));
        let t = tracker(clock);
        t.record_placement(&SpatialKey::in_region("world", 0, 0, 0));
        t.record_placement(&SpatialKey::in_region("nether", 0, 0, 0));
        t.clear_region(&RegionId::intern("nether"));
        assert_eq!(t.stats().placements, 1);
    }
}
