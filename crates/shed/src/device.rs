//! Device-activity culling.
//!
//! Counts update notifications per cell. A cell that keeps updating at or
//! above the dynamic threshold for the grace window is culled: the host is
//! told to suppress its updates until the cull expires. Expiry releases the
//! surrounding cells with an exemption and asks the host to refresh them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashSet;
use ballast_cache::TtlMap;
use ballast_common::{
    Clock, PlayerView, RegionId, SpatialKey, WorldHost, WorldMutation, any_player_within,
};
use ballast_pipeline::{Applied, ApplyReport, Domain, PhaseError, apply_each};
use ballast_telemetry::{ScaleReader, ScaleSample, lerp_int, scale_from_mspt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::tracker::{Candidate, CullPolicy, CullState, CullTracker};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub enabled: bool,
    /// Threshold at saturation, in updates per second.
    pub min_threshold: i32,
    /// Threshold when idle.
    pub max_threshold: i32,
    pub policy: CullPolicy,
    pub scan_period_ms: u64,
    pub expiry_period_ms: u64,
    /// Culls are skipped when a player stands this close.
    pub occupant_radius: f64,
    /// Occupancy is only honoured above this scale.
    pub occupant_check_scale: f64,
    /// Scale above which every cull is released at once. Defaults to the
    /// scale of a 30ms cycle.
    pub recovery_scale: Option<f64>,
    /// How long a suppressed update is remembered for a later refresh.
    pub throttled_retention_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_threshold: 5,
            max_threshold: 20,
            policy: CullPolicy::default(),
            scan_period_ms: 1_000,
            expiry_period_ms: 30_000,
            occupant_radius: 16.0,
            occupant_check_scale: 0.05,
            recovery_scale: None,
            throttled_retention_ms: 60_000,
        }
    }
}

impl DeviceConfig {
    pub fn recovery_scale(&self) -> f64 {
        self.recovery_scale.unwrap_or_else(|| scale_from_mspt(30.0))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub monitored: usize,
    pub culled: usize,
    pub exempt: usize,
    pub throttled: usize,
    pub threshold: u32,
    pub total_culls: u64,
}

struct DeviceState {
    tracker: CullTracker,
    /// Cells whose updates were suppressed while culled.
    throttled: TtlMap<SpatialKey, ()>,
}

/// Device-activity culling state, shared by the scan and expiry domains.
pub struct DeviceCulling {
    config: DeviceConfig,
    clock: Arc<dyn Clock>,
    scale: ScaleReader,
    state: Mutex<DeviceState>,
    total_culls: AtomicU64,
}

impl DeviceCulling {
    pub fn new(config: DeviceConfig, clock: Arc<dyn Clock>, scale: ScaleReader) -> Self {
        let threshold = lerp_int(config.min_threshold, config.max_threshold, scale.scale());
        let state = DeviceState {
            tracker: CullTracker::new(config.policy, threshold.max(1) as u32),
            throttled: TtlMap::new(config.throttled_retention_ms, config.policy.capacity),
        };
        Self {
            config,
            clock,
            scale,
            state: Mutex::new(state),
            total_culls: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Scale subscription: re-derive the threshold.
    pub fn set_scale(&self, scale: f64) {
        let threshold = lerp_int(self.config.min_threshold, self.config.max_threshold, scale);
        self.state.lock().tracker.set_threshold(threshold.max(1) as u32);
    }

    pub fn threshold(&self) -> u32 {
        self.state.lock().tracker.threshold()
    }

    /// Count one update at `key`. Returns true if the host should suppress
    /// it because the cell is culled.
    pub fn record_update(&self, key: &SpatialKey) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if state.tracker.is_culled(key, now) {
            state.throttled.insert(key.clone(), (), now);
            return true;
        }
        state.tracker.record(key, 1, now);
        false
    }

    pub fn is_culled(&self, key: &SpatialKey) -> bool {
        self.state.lock().tracker.is_culled(key, self.clock.now_ms())
    }

    pub fn state_of(&self, key: &SpatialKey) -> CullState {
        self.state.lock().tracker.state(key, self.clock.now_ms())
    }

    /// Release one cell now and protect it for the exemption window.
    pub fn uncull(&self, key: &SpatialKey) -> bool {
        self.state.lock().tracker.uncull(key, self.clock.now_ms())
    }

    pub fn uncull_all(&self) -> Vec<SpatialKey> {
        self.state.lock().tracker.uncull_all()
    }

    pub fn clear_region(&self, region: &RegionId) {
        let mut state = self.state.lock();
        state.tracker.clear_region(region);
        state.throttled.retain(|k, _| k.region() != region);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.tracker.clear();
        state.throttled.clear();
    }

    pub fn stats(&self) -> DeviceStats {
        let state = self.state.lock();
        let tracked = state.tracker.stats();
        DeviceStats {
            monitored: tracked.monitored,
            culled: tracked.culled,
            exempt: tracked.exempt,
            throttled: state.throttled.len(),
            threshold: state.tracker.threshold(),
            total_culls: self.total_culls.load(Ordering::Relaxed),
        }
    }

    fn occupied(&self, scale: f64, players: &[PlayerView], key: &SpatialKey) -> bool {
        scale > self.config.occupant_check_scale
            && any_player_within(players, key.region(), key.center(), self.config.occupant_radius)
    }
}

/// Inputs of one device scan.
pub struct DeviceScanInput {
    pub now: u64,
    pub sample: ScaleSample,
    pub players: Vec<PlayerView>,
}

/// What a device scan decided.
#[derive(Debug, Default)]
pub struct DeviceScanPlan {
    pub scale: f64,
    pub cull: Vec<Candidate>,
    /// Cells to refresh: released by the valve or no longer culled after
    /// being throttled.
    pub refresh: Vec<SpatialKey>,
    pub valve_released: usize,
}

impl Domain for DeviceCulling {
    type Snapshot = DeviceScanInput;
    type Decision = DeviceScanPlan;

    fn name(&self) -> &'static str {
        "device-scan"
    }

    fn snapshot(&self, host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError> {
        if !self.config.enabled {
            return Err(PhaseError::Disabled { domain: self.name() });
        }
        Ok(DeviceScanInput {
            now: self.clock.now_ms(),
            sample: self.scale.sample(),
            players: host.players(),
        })
    }

    fn compute(&self, input: Self::Snapshot) -> Result<Self::Decision, PhaseError> {
        let DeviceScanInput { now, sample, players } = input;
        let mut plan = DeviceScanPlan {
            scale: sample.scale,
            ..DeviceScanPlan::default()
        };

        let mut state = self.state.lock();
        if sample.smoothed_mspt > 0.0 && sample.scale > self.config.recovery_scale() {
            let released = state.tracker.uncull_all();
            if !released.is_empty() {
                tracing::info!(
                    released = released.len(),
                    scale = sample.scale,
                    "load recovered, releasing all culled devices"
                );
            }
            plan.valve_released = released.len();
            plan.refresh = released;
        } else {
            plan.cull = state
                .tracker
                .scan(now)
                .into_iter()
                .filter(|c| !self.occupied(sample.scale, &players, &c.key))
                .collect();
        }

        state.throttled.sweep(now);
        let tracker = &state.tracker;
        let nudge: Vec<SpatialKey> = state
            .throttled
            .keys()
            .filter(|k| !tracker.is_culled(k, now))
            .cloned()
            .collect();
        for key in &nudge {
            state.throttled.remove(key);
        }
        drop(state);

        for key in nudge {
            if !plan.refresh.contains(&key) {
                plan.refresh.push(key);
            }
        }
        Ok(plan)
    }

    fn apply(
        &self,
        host: &mut dyn WorldHost,
        plan: Self::Decision,
    ) -> Result<ApplyReport, PhaseError> {
        let players = if plan.cull.is_empty() {
            Vec::new()
        } else {
            host.players()
        };
        let now = self.clock.now_ms();
        let mut report = apply_each(self.name(), plan.cull, |candidate| {
            if self.occupied(plan.scale, &players, &candidate.key) {
                return Ok(Applied::Skipped);
            }
            if !self.state.lock().tracker.mark_culled(&candidate.key, now) {
                return Ok(Applied::Skipped);
            }
            self.total_culls.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                key = %candidate.key,
                rate = candidate.rate,
                sustained_ms = candidate.sustained_ms,
                "culled device activity"
            );
            Ok(Applied::Done)
        });
        report.merge(refresh_cells(self.name(), host, plan.refresh));
        Ok(report)
    }

    fn is_noop(&self, plan: &Self::Decision) -> bool {
        plan.cull.is_empty() && plan.refresh.is_empty()
    }
}

/// Periodic expiry of device culls.
pub struct DeviceExpiry {
    culling: Arc<DeviceCulling>,
}

impl DeviceExpiry {
    pub fn new(culling: Arc<DeviceCulling>) -> Self {
        Self { culling }
    }
}

impl Domain for DeviceExpiry {
    type Snapshot = u64;
    type Decision = Vec<SpatialKey>;

    fn name(&self) -> &'static str {
        "device-expiry"
    }

    fn snapshot(&self, _host: &dyn WorldHost) -> Result<u64, PhaseError> {
        if !self.culling.config.enabled {
            return Err(PhaseError::Disabled { domain: self.name() });
        }
        Ok(self.culling.clock.now_ms())
    }

    fn compute(&self, now: u64) -> Result<Vec<SpatialKey>, PhaseError> {
        let mut state = self.culling.state.lock();
        let expired = state.tracker.expire(now);
        let mut seen = AHashSet::new();
        let mut released = Vec::new();
        for key in &expired {
            for near in key.neighbourhood(2, 1, 2) {
                state.tracker.uncull(&near, now);
                if seen.insert(near.clone()) {
                    released.push(near);
                }
            }
        }
        if !expired.is_empty() {
            tracing::debug!(
                expired = expired.len(),
                released = released.len(),
                "device culls expired"
            );
        }
        Ok(released)
    }

    fn apply(
        &self,
        host: &mut dyn WorldHost,
        released: Vec<SpatialKey>,
    ) -> Result<ApplyReport, PhaseError> {
        Ok(refresh_cells(self.name(), host, released))
    }

    fn is_noop(&self, released: &Vec<SpatialKey>) -> bool {
        released.is_empty()
    }
}

pub(crate) fn refresh_cells(
    domain: &'static str,
    host: &mut dyn WorldHost,
    keys: Vec<SpatialKey>,
) -> ApplyReport {
    apply_each(domain, keys, |key| {
        host.apply_world(WorldMutation::RefreshCell(key.clone()))
            .map(|_| Applied::Done)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_common::ManualClock;
    use ballast_pipeline::{Executor, PhaseRunner};
    use ballast_sim::{HostEvent, SimWorld};
    use glam::DVec3;

    fn culling(clock: Arc<ManualClock>, mspt: f64) -> Arc<DeviceCulling> {
        let culling = DeviceCulling::new(DeviceConfig::default(), clock, ScaleReader::fixed_mspt(mspt));
        Arc::new(culling)
    }

    fn hammer(clock: &ManualClock, culling: &DeviceCulling, key: &SpatialKey, until: u64) {
        while clock.now_ms() < until {
            culling.record_update(key);
            clock.advance(25);
        }
    }

    #[test]
    fn threshold_follows_scale() {
        let c = culling(Arc::new(ManualClock::new(0)), 20.0);
        c.set_scale(0.0);
        assert_eq!(c.threshold(), 5);
        c.set_scale(1.0);
        assert_eq!(c.threshold(), 20);
        c.set_scale(0.5);
        assert_eq!(c.threshold(), 13);
    }

    #[test]
    fn hot_cell_is_culled_and_suppressed() {
        let clock = Arc::new(ManualClock::new(0));
        let c = culling(clock.clone(), 60.0);
        let runner = PhaseRunner::new(Arc::clone(&c), Executor::new(1).unwrap());
        let mut world = SimWorld::new();
        let key = SpatialKey::at(100, 64, 100);

        hammer(&clock, &c, &key, 3_200);
        let report = runner.run_inline(&mut world).unwrap();
        assert_eq!(report.applied, 1);
        assert!(c.is_culled(&key));
        assert_eq!(c.state_of(&key), CullState::Culled);
        assert!(c.record_update(&key));
        assert_eq!(c.stats().throttled, 1);
    }

    #[test]
    fn occupied_cell_is_left_alone() {
        let clock = Arc::new(ManualClock::new(0));
        let c = culling(clock.clone(), 40.0);
        let runner = PhaseRunner::new(Arc::clone(&c), Executor::new(1).unwrap());
        let mut world = SimWorld::new();
        world.add_player("builder", RegionId::default(), DVec3::new(105.0, 64.0, 100.0));
        let key = SpatialKey::at(100, 64, 100);

        hammer(&clock, &c, &key, 3_200);
        runner.run_inline(&mut world).unwrap();
        assert!(!c.is_culled(&key));
    }

    #[test]
    fn occupancy_is_ignored_at_saturation() {
        let clock = Arc::new(ManualClock::new(0));
        let c = culling(clock.clone(), 200.0);
        let runner = PhaseRunner::new(Arc::clone(&c), Executor::new(1).unwrap());
        let mut world = SimWorld::new();
        world.add_player("builder", RegionId::default(), DVec3::new(100.0, 64.0, 100.0));
        let key = SpatialKey::at(100, 64, 100);

        hammer(&clock, &c, &key, 3_200);
        runner.run_inline(&mut world).unwrap();
        assert!(c.is_culled(&key));
    }

    #[test]
    fn valve_releases_everything_when_load_recovers() {
        let clock = Arc::new(ManualClock::new(0));
        let c = culling(clock.clone(), 20.0);
        let mut world = SimWorld::new();
        let key = SpatialKey::at(1, 2, 3);
        c.state.lock().tracker.mark_culled(&key, 0);

        let runner = PhaseRunner::new(Arc::clone(&c), Executor::new(1).unwrap());
        runner.run_inline(&mut world).unwrap();
        assert!(!c.is_culled(&key));
        assert!(world.refreshed_cells().contains(&key));
    }

    #[test]
    fn expiry_releases_neighbourhood_with_exemption() {
        let clock = Arc::new(ManualClock::new(0));
        let c = culling(clock.clone(), 60.0);
        let mut world = SimWorld::new();
        let key = SpatialKey::at(0, 64, 0);
        let beside = key.offset(1, 0, 0);
        {
            let mut state = c.state.lock();
            state.tracker.mark_culled(&key, 0);
            state.tracker.mark_culled(&beside, 5_000);
        }

        clock.set(10_500);
        let expiry = PhaseRunner::new(Arc::new(DeviceExpiry::new(Arc::clone(&c))), Executor::new(1).unwrap());
        let report = expiry.run_inline(&mut world).unwrap();
        assert_eq!(report.applied, 5 * 3 * 5);
        assert!(!c.is_culled(&key));
        assert!(!c.is_culled(&beside));
        assert_eq!(c.state_of(&beside), CullState::Exempt);
        assert!(world.events().iter().any(|e| matches!(
            e,
            HostEvent::World(WorldMutation::RefreshCell(k)) if *k == key
        )));
        let refreshed = world.refreshed_cells();
        assert!(refreshed.contains(&beside));
        assert!(refreshed.contains(&key.offset(-2, 1, 2)));
        assert_eq!(refreshed.len(), 5 * 3 * 5);

        clock.set(13_000);
        assert_eq!(c.state_of(&beside), CullState::Idle);
    }

    #[test]
    fn throttled_cells_are_nudged_once_released() {
        let clock = Arc::new(ManualClock::new(0));
        let c = culling(clock.clone(), 60.0);
        let key = SpatialKey::at(7, 7, 7);
        c.state.lock().tracker.mark_culled(&key, 0);
        assert!(c.record_update(&key));

        c.uncull(&key);
        let mut world = SimWorld::new();
        let runner = PhaseRunner::new(Arc::clone(&c), Executor::new(1).unwrap());
        runner.run_inline(&mut world).unwrap();
        assert!(world.refreshed_cells().contains(&key));
        assert_eq!(c.stats().throttled, 0);
    }

    #[test]
    fn disabled_domain_refuses_to_run() {
        let clock = Arc::new(ManualClock::new(0));
        let config = DeviceConfig {
            enabled: false,
            ..DeviceConfig::default()
        };
        let c = Arc::new(DeviceCulling::new(config, clock, ScaleReader::fixed_mspt(60.0)));
        assert!(!c.record_update(&SpatialKey::at(0, 0, 0)));
        let mut world = SimWorld::new();
        let runner = PhaseRunner::new(c, Executor::new(1).unwrap());
        assert!(matches!(
            runner.run_inline(&mut world),
            Err(PhaseError::Disabled { .. })
        ));
    }
}
