//! Explosion frequency and intensity throttling.
//!
//! Counts primed explosions per cell in a one second window and cancels the
//! excess. Under heavy load the surviving blasts are shaped: their block list
//! is trimmed or cleared, their yield zeroed and a short freeze window
//! protects decorative objects around the origin.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ballast_cache::{BoundedLru, TtlMap};
use ballast_common::{
    Clock, ObjectId, ObjectKind, PlayerView, RegionId, SpatialKey, any_player_within,
};
use ballast_telemetry::{ScaleReader, clamp01, lerp, scale_from_mspt};
use glam::DVec3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::recent::RecentActionTracker;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplosionConfig {
    pub enabled: bool,
    /// Explosions per cell per window while load is light.
    pub idle_threshold: u32,
    /// Upper end of the interpolated threshold under load.
    pub cap: u32,
    /// Lower end of the interpolated threshold.
    pub floor: u32,
    /// Cost below which the idle threshold applies.
    pub idle_mspt: f64,
    pub window_ms: u64,
    pub severe_mspt: f64,
    pub severe_scale: f64,
    pub moderate_mspt: f64,
    /// Cost span over which a moderate blast loses all of its blocks.
    pub moderate_span_mspt: f64,
    pub freeze_radius: f64,
    pub freeze_ms: u64,
    pub max_freezes: usize,
    pub block_beds: bool,
    pub origin_retention_ms: u64,
    /// Players this close to a freshly primed explosive attribute it.
    pub primer_radius: f64,
    pub capacity: usize,
}

impl ExplosionConfig {
    /// Age at which a tracked origin is swept: twice the retention, never
    /// under ten seconds.
    pub fn origin_cutoff_ms(&self) -> u64 {
        self.origin_retention_ms.saturating_mul(2).max(10_000)
    }
}

impl Default for ExplosionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_threshold: 50,
            cap: 50,
            floor: 5,
            idle_mspt: 25.0,
            window_ms: 1_000,
            severe_mspt: 45.0,
            severe_scale: 0.35,
            moderate_mspt: 35.0,
            moderate_span_mspt: 10.0,
            freeze_radius: 12.0,
            freeze_ms: 2_500,
            max_freezes: 256,
            block_beds: true,
            origin_retention_ms: 30_000,
            primer_radius: 3.0,
            capacity: 5_000,
        }
    }
}

/// What set an explosion off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplosionCause {
    Primed,
    Creature,
    Bed,
    RespawnAnchor,
    Other,
}

/// Who primed an explosive, as far as the host can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primer {
    Player,
    Dispenser,
    Command,
    Unknown,
}

/// Attributed origin of a primed explosive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Origin {
    Player,
    Dispenser,
    Command,
}

#[derive(Debug, Clone)]
pub struct ExplosionEvent {
    /// The exploding object, if any.
    pub source: Option<ObjectId>,
    pub cause: ExplosionCause,
    pub region: RegionId,
    pub origin: DVec3,
    /// Blocks the explosion would destroy.
    pub blocks: Vec<SpatialKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Normal,
    Moderate,
    Severe,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FreezeWindow {
    pub region: RegionId,
    pub center: DVec3,
    pub radius: f64,
    pub until: u64,
}

impl FreezeWindow {
    fn covers(&self, region: &RegionId, position: DVec3, now: u64) -> bool {
        now < self.until
            && self.region == *region
            && self.center.distance_squared(position) <= self.radius * self.radius
    }
}

/// How the host should carry out an explosion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplosionVerdict {
    pub cancel: bool,
    pub zero_yield: bool,
    /// Blocks still to destroy.
    pub blocks: Vec<SpatialKey>,
    pub severity: Severity,
    pub freeze: Option<FreezeWindow>,
}

impl ExplosionVerdict {
    fn proceed(blocks: Vec<SpatialKey>) -> Self {
        Self {
            cancel: false,
            zero_yield: false,
            blocks,
            severity: Severity::Normal,
            freeze: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            cancel: true,
            ..Self::proceed(Vec::new())
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExplosionStats {
    pub cancelled: u64,
    pub shaped: u64,
    pub beds_blocked: u64,
    pub active_freezes: usize,
    pub tracked_origins: usize,
    pub counted_cells: usize,
}

struct ExplosionState {
    counts: BoundedLru<SpatialKey, u32>,
    freezes: VecDeque<FreezeWindow>,
    origins: TtlMap<ObjectId, Origin>,
}

#[derive(Default)]
struct Counters {
    cancelled: AtomicU64,
    shaped: AtomicU64,
    beds_blocked: AtomicU64,
}

/// Explosion throttle. All calls happen on the mutation context as events
/// arrive; the window reset runs on a timer.
pub struct ExplosionThrottle {
    config: ExplosionConfig,
    clock: Arc<dyn Clock>,
    scale: ScaleReader,
    recent: Arc<RecentActionTracker>,
    state: Mutex<ExplosionState>,
    counters: Counters,
}

impl ExplosionThrottle {
    pub fn new(
        config: ExplosionConfig,
        clock: Arc<dyn Clock>,
        scale: ScaleReader,
        recent: Arc<RecentActionTracker>,
    ) -> Self {
        let state = ExplosionState {
            counts: BoundedLru::new(config.capacity),
            freezes: VecDeque::new(),
            origins: TtlMap::new(config.origin_cutoff_ms(), config.capacity),
        };
        Self {
            config,
            clock,
            scale,
            recent,
            state: Mutex::new(state),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &ExplosionConfig {
        &self.config
    }

    /// Explosions per cell allowed in one window at `scale`.
    pub fn effective_threshold(&self, scale: f64) -> u32 {
        if scale > scale_from_mspt(self.config.idle_mspt) {
            return self.config.idle_threshold;
        }
        let value = lerp(self.config.floor as f64, self.config.cap as f64, scale);
        if value < 1.0 { 0 } else { value as u32 }
    }

    /// Record the origin of a freshly primed explosive.
    pub fn on_primed(&self, id: ObjectId, key: &SpatialKey, primer: Primer, players: &[PlayerView]) {
        if !self.config.enabled {
            return;
        }
        let origin = if primer == Primer::Player || self.recent.placed_recently(key) {
            Some(Origin::Player)
        } else if primer == Primer::Dispenser || self.recent.dispensed_recently(key) {
            Some(Origin::Dispenser)
        } else if any_player_within(players, key.region(), key.center(), self.config.primer_radius) {
            Some(Origin::Player)
        } else if primer == Primer::Command {
            Some(Origin::Command)
        } else {
            None
        };
        if let Some(origin) = origin {
            let now = self.clock.now_ms();
            self.state.lock().origins.insert(id, origin, now);
        }
    }

    pub fn origin_of(&self, id: ObjectId) -> Option<Origin> {
        self.state.lock().origins.get(&id).copied()
    }

    /// Decide how an explosion proceeds.
    pub fn on_explosion(&self, event: ExplosionEvent) -> ExplosionVerdict {
        if !self.config.enabled {
            return ExplosionVerdict::proceed(event.blocks);
        }
        match event.cause {
            ExplosionCause::Bed | ExplosionCause::RespawnAnchor if self.config.block_beds => {
                self.counters.beds_blocked.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(region = %event.region, origin = ?event.origin, "blocked bed explosion");
                return ExplosionVerdict::cancelled();
            }
            ExplosionCause::Primed => {}
            _ => return ExplosionVerdict::proceed(event.blocks),
        }

        let now = self.clock.now_ms();
        let sample = self.scale.sample();
        // Frequency and severity follow the latest cost, shaping the smoothed one.
        let load_scale = if sample.raw_mspt > 0.0 {
            scale_from_mspt(sample.raw_mspt)
        } else {
            sample.scale
        };
        let key = SpatialKey::from_position(event.region.clone(), event.origin);

        let (count, origin) = {
            let mut state = self.state.lock();
            let count = {
                let slot = state.counts.get_or_insert_with(key.clone(), || 0);
                *slot += 1;
                *slot
            };
            let origin = event.source.and_then(|id| state.origins.remove(&id));
            (count, origin)
        };

        if count > self.effective_threshold(load_scale) {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%key, count, "cancelled explosion spam");
            return ExplosionVerdict::cancelled();
        }

        let player_made = origin == Some(Origin::Player)
            || event.source.is_some_and(|id| self.recent.spawned_by_player(id));
        if player_made {
            return ExplosionVerdict::proceed(event.blocks);
        }

        let smoothed = sample.smoothed_mspt;
        if smoothed >= self.config.severe_mspt || load_scale <= self.config.severe_scale {
            let freeze = self.open_freeze(&event, now);
            self.counters.shaped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%key, scale = load_scale, smoothed, "froze explosion");
            return ExplosionVerdict {
                cancel: false,
                zero_yield: true,
                blocks: Vec::new(),
                severity: Severity::Severe,
                freeze: Some(freeze),
            };
        }

        if smoothed >= self.config.moderate_mspt && !event.blocks.is_empty() {
            let span = self.config.moderate_span_mspt.max(f64::EPSILON);
            let fraction = 1.0 - clamp01((smoothed - self.config.moderate_mspt) / span);
            let original = event.blocks.len();
            let keep = (original as f64 * fraction).round() as usize;
            if keep < original {
                let mut blocks = event.blocks.clone();
                let origin_at = event.origin;
                blocks.sort_by(|a, b| {
                    a.center()
                        .distance_squared(origin_at)
                        .total_cmp(&b.center().distance_squared(origin_at))
                });
                blocks.truncate(keep);
                let freeze = self.open_freeze(&event, now);
                self.counters.shaped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%key, from = original, to = keep, smoothed, "shrunk explosion");
                return ExplosionVerdict {
                    cancel: false,
                    zero_yield: true,
                    blocks,
                    severity: Severity::Moderate,
                    freeze: Some(freeze),
                };
            }
        }
        ExplosionVerdict::proceed(event.blocks)
    }

    fn open_freeze(&self, event: &ExplosionEvent, now: u64) -> FreezeWindow {
        let window = FreezeWindow {
            region: event.region.clone(),
            center: event.origin,
            radius: self.config.freeze_radius,
            until: now + self.config.freeze_ms,
        };
        let mut state = self.state.lock();
        while state.freezes.len() >= self.config.max_freezes.max(1) {
            state.freezes.pop_front();
        }
        state.freezes.push_back(window.clone());
        window
    }

    /// True if explosion damage to this object should be cancelled.
    pub fn should_cancel_damage(&self, kind: ObjectKind, region: &RegionId, position: DVec3) -> bool {
        if !self.config.enabled || !kind.is_decorative() {
            return false;
        }
        let now = self.clock.now_ms();
        self.state
            .lock()
            .freezes
            .iter()
            .any(|f| f.covers(region, position, now))
    }

    /// Window boundary: clear counts, drop lapsed freezes and stale origins.
    pub fn reset_window(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.counts.clear();
        state.freezes.retain(|f| f.until > now);
        state.origins.sweep(now);
    }

    pub fn clear_region(&self, region: &RegionId) {
        let mut state = self.state.lock();
        state.counts.retain(|k, _| k.region() != region);
        state.freezes.retain(|f| f.region != *region);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.counts.clear();
        state.freezes.clear();
        state.origins.clear();
    }

    pub fn stats(&self) -> ExplosionStats {
        let now = self.clock.now_ms();
        let state = self.state.lock();
        ExplosionStats {
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            shaped: self.counters.shaped.load(Ordering::Relaxed),
            beds_blocked: self.counters.beds_blocked.load(Ordering::Relaxed),
            active_freezes: state.freezes.iter().filter(|f| f.until > now).count(),
            tracked_origins: state.origins.len(),
            counted_cells: state.counts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recent::RecentConfig;
    use ballast_common::ManualClock;
    use ballast_telemetry::ScaleSample;

    fn throttle(mspt: f64) -> (Arc<ManualClock>, Arc<RecentActionTracker>, ExplosionThrottle) {
        let clock = Arc::new(ManualClock::new(0));
        let recent = Arc::new(RecentActionTracker::new(RecentConfig::default(), clock.clone()));
        let t = ExplosionThrottle::new(
            ExplosionConfig::default(),
            clock.clone(),
            ScaleReader::fixed_mspt(mspt),
            Arc::clone(&recent),
        );
        (clock, recent, t)
    }

    fn blast(source: Option<ObjectId>, blocks: usize) -> ExplosionEvent {
        ExplosionEvent {
            source,
            cause: ExplosionCause::Primed,
            region: RegionId::default(),
            origin: DVec3::new(0.5, 64.5, 0.5),
            blocks: (0..blocks as i32).map(|i| SpatialKey::at(i, 64, 0)).collect(),
        }
    }

    #[test]
    fn threshold_tracks_load() {
        let (_, _, t) = throttle(20.0);
        assert_eq!(t.effective_threshold(1.0), 50);
        assert_eq!(t.effective_threshold(0.0), 5);
        let mid = t.effective_threshold(0.5);
        assert_eq!(mid, 27);
    }

    #[test]
    fn spam_beyond_threshold_is_cancelled() {
        let (clock, _, t) = throttle(40.0);
        let threshold = t.effective_threshold(scale_from_mspt(40.0));
        for _ in 0..threshold {
            assert!(!t.on_explosion(blast(None, 0)).cancel);
        }
        assert!(t.on_explosion(blast(None, 0)).cancel);
        assert_eq!(t.stats().cancelled, 1);

        clock.advance(1_000);
        t.reset_window();
        assert!(!t.on_explosion(blast(None, 0)).cancel);
    }

    #[test]
    fn severe_load_clears_blocks_and_freezes() {
        let (clock, _, t) = throttle(50.0);
        let verdict = t.on_explosion(blast(None, 20));
        assert_eq!(verdict.severity, Severity::Severe);
        assert!(verdict.zero_yield);
        assert!(verdict.blocks.is_empty());
        assert!(verdict.freeze.is_some());

        let region = RegionId::default();
        let near = DVec3::new(5.0, 64.0, 0.0);
        assert!(t.should_cancel_damage(ObjectKind::ArmorStand, &region, near));
        assert!(!t.should_cancel_damage(ObjectKind::Mob, &region, near));
        assert!(!t.should_cancel_damage(ObjectKind::Item, &region, DVec3::new(50.0, 64.0, 0.0)));

        clock.advance(2_500);
        assert!(!t.should_cancel_damage(ObjectKind::ArmorStand, &region, near));
    }

    #[test]
    fn moderate_load_keeps_nearest_blocks() {
        let clock = Arc::new(ManualClock::new(0));
        let recent = Arc::new(RecentActionTracker::new(RecentConfig::default(), clock.clone()));
        // The smoothed cost still lags behind a recovering raw cost.
        let reader = ScaleReader::fixed(ScaleSample {
            raw_mspt: 25.0,
            smoothed_mspt: 40.0,
            scale: scale_from_mspt(40.0),
            velocity: 0.0,
        });
        let t = ExplosionThrottle::new(ExplosionConfig::default(), clock, reader, recent);
        let verdict = t.on_explosion(blast(None, 10));
        assert_eq!(verdict.severity, Severity::Moderate);
        assert!(verdict.zero_yield);
        assert_eq!(verdict.blocks.len(), 5);
        assert!(verdict.blocks.iter().all(|b| b.x() < 5));
    }

    #[test]
    fn player_primed_explosives_are_not_shaped() {
        let (_, _, t) = throttle(50.0);
        let id = ObjectId::new();
        t.on_primed(id, &SpatialKey::at(0, 64, 0), Primer::Player, &[]);
        assert_eq!(t.origin_of(id), Some(Origin::Player));
        let verdict = t.on_explosion(blast(Some(id), 20));
        assert_eq!(verdict.severity, Severity::Normal);
        assert_eq!(verdict.blocks.len(), 20);
        assert!(t.origin_of(id).is_none());
    }

    #[test]
    fn recent_placement_attributes_the_player() {
        let (_, recent, t) = throttle(50.0);
        let key = SpatialKey::at(0, 64, 0);
        recent.record_placement(&key);
        let id = ObjectId::new();
        t.on_primed(id, &key, Primer::Unknown, &[]);
        assert_eq!(t.origin_of(id), Some(Origin::Player));
    }

    #[test]
    fn dispensed_explosives_are_still_shaped() {
        let (_, _, t) = throttle(50.0);
        let id = ObjectId::new();
        t.on_primed(id, &SpatialKey::at(0, 64, 0), Primer::Dispenser, &[]);
        assert_eq!(t.origin_of(id), Some(Origin::Dispenser));
        assert_eq!(t.on_explosion(blast(Some(id), 5)).severity, Severity::Severe);
    }

    #[test]
    fn beds_are_blocked_and_creatures_pass() {
        let (_, _, t) = throttle(50.0);
        let mut bed = blast(None, 3);
        bed.cause = ExplosionCause::Bed;
        assert!(t.on_explosion(bed).cancel);

        let mut creeper = blast(None, 3);
        creeper.cause = ExplosionCause::Creature;
        let verdict = t.on_explosion(creeper);
        assert!(!verdict.cancel);
        assert_eq!(verdict.blocks.len(), 3);
        assert_eq!(t.stats().beds_blocked, 1);
    }

    #[test]
    fn origins_expire_on_window_reset() {
        let (clock, _, t) = throttle(20.0);
        let id = ObjectId::new();
        t.on_primed(id, &SpatialKey::at(0, 0, 0), Primer::Command, &[]);
        clock.advance(30_001);
        t.reset_window();
        assert_eq!(t.origin_of(id), Some(Origin::Command));
        clock.advance(30_000);
        t.reset_window();
        assert_eq!(t.stats().tracked_origins, 0);
    }

    #[test]
    fn origin_cutoff_is_twice_retention_with_a_floor() {
        let mut config = ExplosionConfig::default();
        assert_eq!(config.origin_cutoff_ms(), 60_000);
        config.origin_retention_ms = 2_000;
        assert_eq!(config.origin_cutoff_ms(), 10_000);
    }
}
