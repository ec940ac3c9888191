use ballast_cache::{DeadlineMap, TtlMap};
use ballast_common::{RegionId, SpatialKey};
use serde::{Deserialize, Serialize};

/// Timing and sizing of a [`CullTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CullPolicy {
    /// Width of one rate bucket.
    pub bucket_ms: u64,
    /// How long a key must stay above the threshold before it is culled.
    pub grace_ms: u64,
    /// How long a culled key stays culled.
    pub culled_ttl_ms: u64,
    /// Keys with no activity for this long are forgotten.
    pub idle_prune_ms: u64,
    /// Protection window granted by an uncull.
    pub exemption_ms: u64,
    /// Upper bound of every map the tracker keeps.
    pub capacity: usize,
}

impl Default for CullPolicy {
    fn default() -> Self {
        Self {
            bucket_ms: 1_000,
            grace_ms: 3_000,
            culled_ttl_ms: 10_000,
            idle_prune_ms: 5_000,
            exemption_ms: 2_000,
            capacity: 50_000,
        }
    }
}

/// Per-key lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CullState {
    Idle,
    Monitored,
    Culled,
    Exempt,
}

/// Update activity of one key, bucketed per `bucket_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityRecord {
    /// Updates in the current bucket.
    pub count: u32,
    pub last_update: u64,
    bucket_start: u64,
    /// Start of the first bucket of the current over-threshold run.
    run_start: Option<u64>,
}

impl ActivityRecord {
    fn fresh(now: u64) -> Self {
        Self {
            count: 0,
            last_update: now,
            bucket_start: now,
            run_start: None,
        }
    }

    fn record(&mut self, n: u32, now: u64, threshold: u32, bucket_ms: u64) {
        let since_update = now.saturating_sub(self.last_update);
        let since_bucket = now.saturating_sub(self.bucket_start);
        if since_update > bucket_ms || since_bucket >= 2 * bucket_ms {
            *self = Self::fresh(now);
        } else if since_bucket >= bucket_ms {
            if self.count < threshold {
                self.run_start = None;
            }
            self.bucket_start += bucket_ms;
            self.count = 0;
        }
        self.count = self.count.saturating_add(n);
        self.last_update = now;
        if self.count >= threshold && self.run_start.is_none() {
            self.run_start = Some(self.bucket_start);
        }
    }

    /// Start of the over-threshold run still in progress at `now`.
    fn sustained_since(&self, now: u64, threshold: u32, bucket_ms: u64) -> Option<u64> {
        if now.saturating_sub(self.last_update) > bucket_ms {
            return None;
        }
        let bucket_done = now.saturating_sub(self.bucket_start) >= bucket_ms;
        if bucket_done && self.count < threshold {
            return None;
        }
        self.run_start
    }
}

/// A key that has stayed above the threshold for the whole grace window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: SpatialKey,
    /// Updates in the key's current bucket.
    pub rate: u32,
    pub sustained_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub monitored: usize,
    pub culled: usize,
    pub exempt: usize,
}

/// Rate tracking and the Idle / Monitored / Culled / Exempt state machine.
///
/// Shared by device and particle culling. Not synchronized; owners wrap it in
/// a lock and keep each call short.
#[derive(Debug, Clone)]
pub struct CullTracker {
    policy: CullPolicy,
    threshold: u32,
    activity: TtlMap<SpatialKey, ActivityRecord>,
    culled: TtlMap<SpatialKey, ()>,
    exempt: DeadlineMap<SpatialKey>,
}

impl CullTracker {
    pub fn new(policy: CullPolicy, threshold: u32) -> Self {
        Self {
            activity: TtlMap::new(policy.idle_prune_ms, policy.capacity),
            culled: TtlMap::new(policy.culled_ttl_ms, policy.capacity),
            exempt: DeadlineMap::new(policy.capacity),
            threshold: threshold.max(1),
            policy,
        }
    }

    pub fn policy(&self) -> &CullPolicy {
        &self.policy
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Updates per bucket at or above which a key is hot. Clamped to 1.
    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold.max(1);
    }

    /// Count `n` updates at `key`. Suppressed keys are not counted.
    pub fn record(&mut self, key: &SpatialKey, n: u32, now: u64) {
        if self.is_culled(key, now) {
            return;
        }
        let threshold = self.threshold;
        let bucket_ms = self.policy.bucket_ms;
        self.activity
            .touch_or_insert_with(key.clone(), now, || ActivityRecord::fresh(now))
            .record(n, now, threshold, bucket_ms);
    }

    pub fn activity(&self, key: &SpatialKey) -> Option<&ActivityRecord> {
        self.activity.get(key)
    }

    /// Keys that have been hot for the whole grace window and are neither
    /// culled nor exempt. Also prunes idle records and lapsed exemptions.
    pub fn scan(&mut self, now: u64) -> Vec<Candidate> {
        self.exempt.sweep(now);
        self.activity.sweep(now);
        let mut found = Vec::new();
        for (key, record) in self.activity.iter() {
            if self.culled.contains_key(key) || self.exempt.is_active(key, now) {
                continue;
            }
            let Some(start) = record.sustained_since(now, self.threshold, self.policy.bucket_ms)
            else {
                continue;
            };
            let sustained_ms = now.saturating_sub(start);
            if sustained_ms >= self.policy.grace_ms {
                found.push(Candidate {
                    key: key.clone(),
                    rate: record.count,
                    sustained_ms,
                });
            }
        }
        found
    }

    /// Move a key to Culled. Refused while the key is exempt.
    pub fn mark_culled(&mut self, key: &SpatialKey, now: u64) -> bool {
        if self.exempt.is_active(key, now) {
            return false;
        }
        if self.culled.contains_key(key) && !self.culled.is_expired(key, now) {
            return false;
        }
        self.culled.insert(key.clone(), (), now);
        true
    }

    pub fn is_culled(&self, key: &SpatialKey, now: u64) -> bool {
        self.culled.contains_key(key)
            && !self.culled.is_expired(key, now)
            && !self.exempt.is_active(key, now)
    }

    pub fn state(&self, key: &SpatialKey, now: u64) -> CullState {
        if self.exempt.is_active(key, now) {
            CullState::Exempt
        } else if self.is_culled(key, now) {
            CullState::Culled
        } else if self
            .activity
            .stamp(key)
            .is_some_and(|t| now.saturating_sub(t) <= self.policy.idle_prune_ms)
        {
            CullState::Monitored
        } else {
            CullState::Idle
        }
    }

    /// Release every key culled longer than the TTL and forget its activity.
    pub fn expire(&mut self, now: u64) -> Vec<SpatialKey> {
        let expired: Vec<SpatialKey> = self.culled.sweep(now).into_iter().map(|(k, _)| k).collect();
        for key in &expired {
            self.activity.remove(key);
        }
        expired
    }

    /// Drop every record of `key` and protect it for the exemption window.
    /// Returns true if the key was culled.
    pub fn uncull(&mut self, key: &SpatialKey, now: u64) -> bool {
        let was_culled = self.culled.remove(key).is_some();
        self.activity.remove(key);
        self.exempt
            .set(key.clone(), now + self.policy.exemption_ms, now);
        was_culled
    }

    /// Release every culled key at once. Returns the released keys.
    pub fn uncull_all(&mut self) -> Vec<SpatialKey> {
        let released: Vec<SpatialKey> = self.culled.keys().cloned().collect();
        self.culled.clear();
        self.exempt.clear();
        for key in &released {
            self.activity.remove(key);
        }
        released
    }

    pub fn culled_keys(&self) -> Vec<SpatialKey> {
        self.culled.keys().cloned().collect()
    }

    pub fn clear_region(&mut self, region: &RegionId) {
        self.activity.retain(|k, _| k.region() != region);
        self.culled.retain(|k, _| k.region() != region);
        self.exempt.retain(|k| k.region() != region);
    }

    pub fn clear(&mut self) {
        self.activity.clear();
        self.culled.clear();
        self.exempt.clear();
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            monitored: self.activity.len(),
            culled: self.culled.len(),
            exempt: self.exempt.len(),
        }
    }
}
