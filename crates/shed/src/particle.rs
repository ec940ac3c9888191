use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ballast_common::{Clock, PlayerView, RegionId, SpatialKey, WorldHost, any_player_within};
use ballast_pipeline::{Applied, ApplyReport, Domain, PhaseError, apply_each};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::tracker::{Candidate, CullPolicy, CullTracker, TrackerStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleConfig {
    pub enabled: bool,
    /// Effects per second per cell.
    pub threshold: u32,
    pub policy: CullPolicy,
    pub scan_period_ms: u64,
    pub occupant_radius: f64,
    /// Explosions touching more blocks than this count as effect bursts.
    pub burst_min_blocks: usize,
    pub burst_max_blocks: usize,
    pub burst_divisor: usize,
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 100,
            policy: CullPolicy {
                grace_ms: 0,
                culled_ttl_ms: 30_000,
                ..CullPolicy::default()
            },
            scan_period_ms: 5_000,
            occupant_radius: 16.0,
            burst_min_blocks: 8,
            burst_max_blocks: 200,
            burst_divisor: 8,
        }
    }
}

/// Particle and effect spam culling. No grace window and no recovery valve.
pub struct ParticleCulling {
    config: ParticleConfig,
    clock: Arc<dyn Clock>,
    tracker: Mutex<CullTracker>,
    total_culls: AtomicU64,
}

impl ParticleCulling {
    pub fn new(config: ParticleConfig, clock: Arc<dyn Clock>) -> Self {
        let tracker = CullTracker::new(config.policy, config.threshold);
        Self {
            config,
            clock,
            tracker: Mutex::new(tracker),
            total_culls: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ParticleConfig {
        &self.config
    }

    /// Count one effect at `key`. Returns true if it should be suppressed.
    pub fn record_effect(&self, key: &SpatialKey) -> bool {
        self.record_effects(key, 1)
    }

    pub fn record_effects(&self, key: &SpatialKey, n: u32) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now = self.clock.now_ms();
        let mut tracker = self.tracker.lock();
        if tracker.is_culled(key, now) {
            return true;
        }
        tracker.record(key, n, now);
        false
    }

    /// Account for the effects of an explosion touching `affected_blocks`.
    ///
    /// Large blasts add `intensity / divisor` effects at the origin and its
    /// four horizontal neighbours. With no player within the occupant radius
    /// the origin is culled straight away. Returns true in that case.
    pub fn record_explosion(
        &self,
        origin: &SpatialKey,
        affected_blocks: usize,
        players: &[PlayerView],
    ) -> bool {
        if !self.config.enabled || affected_blocks <= self.config.burst_min_blocks {
            return false;
        }
        let intensity = affected_blocks.min(self.config.burst_max_blocks);
        let burst = (intensity / self.config.burst_divisor.max(1)) as u32;
        let now = self.clock.now_ms();
        let mut tracker = self.tracker.lock();
        for key in [
            origin.clone(),
            origin.offset(1, 0, 0),
            origin.offset(-1, 0, 0),
            origin.offset(0, 0, 1),
            origin.offset(0, 1, 0),
        ] {
            tracker.record(&key, burst, now);
        }
        if any_player_within(players, origin.region(), origin.center(), self.config.occupant_radius) {
            return false;
        }
        let culled = tracker.mark_culled(origin, now);
        if culled {
            self.total_culls.fetch_add(1, Ordering::Relaxed);
        }
        culled
    }

    pub fn is_culled(&self, key: &SpatialKey) -> bool {
        self.tracker.lock().is_culled(key, self.clock.now_ms())
    }

    pub fn clear_region(&self, region: &RegionId) {
        self.tracker.lock().clear_region(region);
    }

    pub fn clear(&self) {
        self.tracker.lock().clear();
    }

    pub fn stats(&self) -> TrackerStats {
        self.tracker.lock().stats()
    }

    pub fn total_culls(&self) -> u64 {
        self.total_culls.load(Ordering::Relaxed)
    }
}

pub struct ParticleScanInput {
    pub now: u64,
    pub players: Vec<PlayerView>,
}

impl Domain for ParticleCulling {
    type Snapshot = ParticleScanInput;
    type Decision = Vec<Candidate>;

    fn name(&self) -> &'static str {
        "particle-scan"
    }

    fn snapshot(&self, host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError> {
        if !self.config.enabled {
            return Err(PhaseError::Disabled { domain: self.name() });
        }
        Ok(ParticleScanInput {
            now: self.clock.now_ms(),
            players: host.players(),
        })
    }

    fn compute(&self, input: Self::Snapshot) -> Result<Self::Decision, PhaseError> {
        let radius = self.config.occupant_radius;
        let mut tracker = self.tracker.lock();
        let expired = tracker.expire(input.now);
        if !expired.is_empty() {
            tracing::debug!(expired = expired.len(), "particle culls expired");
        }
        Ok(tracker
            .scan(input.now)
            .into_iter()
            .filter(|c| !any_player_within(&input.players, c.key.region(), c.key.center(), radius))
            .collect())
    }

    fn apply(
        &self,
        host: &mut dyn WorldHost,
        candidates: Self::Decision,
    ) -> Result<ApplyReport, PhaseError> {
        let players = host.players();
        let radius = self.config.occupant_radius;
        let now = self.clock.now_ms();
        Ok(apply_each(self.name(), candidates, |c| {
            if any_player_within(&players, c.key.region(), c.key.center(), radius) {
                return Ok(Applied::Skipped);
            }
            if !self.tracker.lock().mark_culled(&c.key, now) {
                return Ok(Applied::Skipped);
            }
            self.total_culls.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(key = %c.key, rate = c.rate, "culled particles");
            Ok(Applied::Done)
        }))
    }

    fn is_noop(&self, candidates: &Self::Decision) -> bool {
        candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_common::{ManualClock, ObjectId};
    use ballast_pipeline::{Executor, PhaseRunner};
    use ballast_sim::SimWorld;
    use crate::tracker::CullState;
    use glam::DVec3;

    fn particles(clock: Arc<ManualClock>) -> Arc<ParticleCulling> {
        Arc::new(ParticleCulling::new(ParticleConfig::default(), clock))
    }

    #[test]
    fn spam_is_culled_without_grace() {
        let clock = Arc::new(ManualClock::new(0));
        let p = particles(clock.clone());
        let key = SpatialKey::at(3, 70, 3);
        for _ in 0..120 {
            p.record_effect(&key);
            clock.advance(5);
        }
        let mut world = SimWorld::new();
        let runner = PhaseRunner::new(Arc::clone(&p), Executor::new(1).unwrap());
        let report = runner.run_inline(&mut world).unwrap();
        assert_eq!(report.applied, 1);
        assert!(p.is_culled(&key));
        assert!(p.record_effect(&key));

        clock.advance(30_001);
        runner.run_inline(&mut world).unwrap();
        assert!(!p.is_culled(&key));
        assert_eq!(p.stats().culled, 0);
    }

    #[test]
    fn moderate_effects_pass() {
        let clock = Arc::new(ManualClock::new(0));
        let p = particles(clock.clone());
        let key = SpatialKey::at(0, 0, 0);
        for _ in 0..300 {
            p.record_effect(&key);
            clock.advance(20);
        }
        let mut world = SimWorld::new();
        let runner = PhaseRunner::new(Arc::clone(&p), Executor::new(1).unwrap());
        runner.run_inline(&mut world).unwrap();
        assert!(!p.is_culled(&key));
    }

    #[test]
    fn large_unwatched_explosion_culls_origin() {
        let clock = Arc::new(ManualClock::new(0));
        let p = particles(clock);
        let origin = SpatialKey::at(0, 64, 0);
        assert!(!p.record_explosion(&origin, 8, &[]));
        assert!(p.record_explosion(&origin, 80, &[]));
        assert!(p.is_culled(&origin));
        assert_eq!(p.stats().monitored, 5);
    }

    #[test]
    fn explosion_burst_reaches_the_cell_above() {
        let clock = Arc::new(ManualClock::new(0));
        let p = particles(clock);
        let origin = SpatialKey::at(0, 64, 0);
        p.record_explosion(&origin, 80, &[]);
        let tracker = p.tracker.lock();
        assert_eq!(tracker.state(&origin.offset(0, 1, 0), 0), CullState::Monitored);
        assert_eq!(tracker.state(&origin.offset(0, 0, -1), 0), CullState::Idle);
    }

    #[test]
    fn watched_explosion_is_only_counted() {
        let clock = Arc::new(ManualClock::new(0));
        let p = particles(clock);
        let origin = SpatialKey::at(0, 64, 0);
        let watcher = PlayerView {
            id: ObjectId::new(),
            name: "watcher".into(),
            region: RegionId::default(),
            position: DVec3::new(4.0, 64.0, 0.0),
        };
        assert!(!p.record_explosion(&origin, 400, &[watcher]));
        assert!(!p.is_culled(&origin));
    }
}
