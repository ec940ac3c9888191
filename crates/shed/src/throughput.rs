//! Per-cell transfer limiting for item-moving devices.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ballast_cache::{BoundedLru, DeadlineMap};
use ballast_common::{Clock, RegionId, SpatialKey};
use ballast_telemetry::multiplier_from_scale;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::recent::RecentActionTracker;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputConfig {
    pub enabled: bool,
    /// Transfers per cell per second before the scale multiplier.
    pub base_limit: u32,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    pub placement_boost: u32,
    pub dispense_boost: u32,
    /// Pause for an empty source under a solid cover.
    pub cooldown_ms: u64,
    pub reset_period_ms: u64,
    pub capacity: usize,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_limit: 64,
            min_multiplier: 0.5,
            max_multiplier: 2.0,
            placement_boost: 4,
            dispense_boost: 2,
            cooldown_ms: 10_000,
            reset_period_ms: 1_000,
            capacity: 5_000,
        }
    }
}

/// A transfer the host is about to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: SpatialKey,
    /// The source holds nothing.
    pub source_empty: bool,
    /// Something solid that is not a container sits on top of the source.
    pub covered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Cooldown,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferVerdict {
    Allow,
    Deny(DenyReason),
}

impl TransferVerdict {
    pub fn allowed(self) -> bool {
        self == TransferVerdict::Allow
    }
}

/// Caps transfers per source cell, with headroom for cells players
/// recently built or fed.
pub struct ThroughputLimiter {
    config: ThroughputConfig,
    clock: Arc<dyn Clock>,
    recent: Arc<RecentActionTracker>,
    limit: AtomicU32,
    counts: Mutex<BoundedLru<SpatialKey, u32>>,
    cooldowns: Mutex<DeadlineMap<SpatialKey>>,
}

impl ThroughputLimiter {
    pub fn new(config: ThroughputConfig, clock: Arc<dyn Clock>, recent: Arc<RecentActionTracker>) -> Self {
        let counts = Mutex::new(BoundedLru::new(config.capacity));
        let cooldowns = Mutex::new(DeadlineMap::new(config.capacity));
        Self {
            limit: AtomicU32::new(config.base_limit.max(1)),
            config,
            clock,
            recent,
            counts,
            cooldowns,
        }
    }

    pub fn config(&self) -> &ThroughputConfig {
        &self.config
    }

    /// Scale subscription.
    pub fn set_scale(&self, scale: f64) {
        let m = multiplier_from_scale(scale, self.config.min_multiplier, self.config.max_multiplier);
        let limit = (self.config.base_limit as f64 * m).round().max(1.0) as u32;
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Limit for `source` after any boost for recent player activity.
    pub fn effective_limit(&self, source: &SpatialKey) -> u32 {
        let limit = self.limit();
        let base = self.config.base_limit.max(1);
        if self.recent.placed_recently(source) {
            limit.max(base.saturating_mul(self.config.placement_boost))
        } else if self.recent.dispensed_recently(source) {
            limit.max(base.saturating_mul(self.config.dispense_boost))
        } else {
            limit
        }
    }

    pub fn on_transfer(&self, request: &TransferRequest) -> TransferVerdict {
        if !self.config.enabled {
            return TransferVerdict::Allow;
        }
        let now = self.clock.now_ms();
        {
            let mut cooldowns = self.cooldowns.lock();
            if cooldowns.check(&request.source, now) {
                return TransferVerdict::Deny(DenyReason::Cooldown);
            }
            if request.covered && request.source_empty {
                cooldowns.set(request.source.clone(), now + self.config.cooldown_ms, now);
                return TransferVerdict::Deny(DenyReason::Cooldown);
            }
        }
        let limit = self.effective_limit(&request.source);
        let mut counts = self.counts.lock();
        let count = counts.get_or_insert_with(request.source.clone(), || 0);
        *count = count.saturating_add(1);
        if *count > limit {
            TransferVerdict::Deny(DenyReason::Limit)
        } else {
            TransferVerdict::Allow
        }
    }

    /// A block changed at `changed`; the source below it may be able to
    /// pull again.
    pub fn on_neighbour_changed(&self, changed: &SpatialKey) {
        self.cooldowns.lock().remove(&changed.offset(0, -1, 0));
    }

    pub fn is_cooling_down(&self, source: &SpatialKey) -> bool {
        self.cooldowns.lock().is_active(source, self.clock.now_ms())
    }

    /// Runs every reset period.
    pub fn reset_counters(&self) {
        self.counts.lock().clear();
        let swept = self.cooldowns.lock().sweep(self.clock.now_ms());
        if swept > 0 {
            tracing::trace!(swept, "transfer cooldowns elapsed");
        }
    }

    pub fn clear_region(&self, region: &RegionId) {
        self.counts.lock().retain(|k, _| k.region() != region);
        self.cooldowns.lock().retain(|k| k.region() != region);
    }

    pub fn clear(&self) {
        self.counts.lock().clear();
        self.cooldowns.lock().clear();
    }
}
