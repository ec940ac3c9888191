use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ballast_cache::BoundedLru;
use ballast_common::{
    Clock, Mutation, ObjectFilter, ObjectId, ObjectKind, ObjectSnapshot, PlayerView, WorldHost,
    any_player_within,
};
use ballast_pipeline::{Applied, ApplyReport, Domain, PhaseError, apply_each};
use glam::DVec3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectileConfig {
    pub enabled: bool,
    pub period_ms: u64,
    /// Squared speed under which a projectile counts as slow.
    pub slow_velocity_sq: f64,
    /// Squared movement between checks under which it counts as stationary.
    pub stationary_epsilon_sq: f64,
    pub stationary_checks: u32,
    /// Slow or stuck projectiles older than this are removed.
    pub stale_age_ms: u64,
    /// Any projectile older than this is removed.
    pub max_age_ms: u64,
    /// Tracking of projectiles kept alive by nearby players ends here.
    pub hard_cap_ms: u64,
    pub occupant_radius: f64,
    pub capacity: usize,
}

impl Default for ProjectileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 2_000,
            slow_velocity_sq: 0.04,
            stationary_epsilon_sq: 0.0001,
            stationary_checks: 3,
            stale_age_ms: 5_000,
            max_age_ms: 20_000,
            hard_cap_ms: 60_000,
            occupant_radius: 16.0,
            capacity: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Flight {
    launched_at: u64,
    last_position: Option<DVec3>,
    stationary: u32,
}

pub struct ProjectileInput {
    pub now: u64,
    pub projectiles: Vec<ObjectSnapshot>,
    pub players: Vec<PlayerView>,
}

#[derive(Debug, Default)]
pub struct ProjectilePlan {
    pub remove: Vec<ObjectId>,
}

/// Removes projectiles that are stuck, crawling or simply too old.
pub struct ProjectileCleanup {
    config: ProjectileConfig,
    clock: Arc<dyn Clock>,
    flights: Mutex<BoundedLru<ObjectId, Flight>>,
    removed: AtomicU64,
}

impl ProjectileCleanup {
    pub fn new(config: ProjectileConfig, clock: Arc<dyn Clock>) -> Self {
        let flights = Mutex::new(BoundedLru::new(config.capacity));
        Self {
            config,
            clock,
            flights,
            removed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ProjectileConfig {
        &self.config
    }

    pub fn on_launch(&self, id: ObjectId) {
        if !self.config.enabled {
            return;
        }
        let flight = Flight {
            launched_at: self.clock.now_ms(),
            last_position: None,
            stationary: 0,
        };
        self.flights.lock().put(id, flight);
    }

    /// Hit, removal or unload ends tracking.
    pub fn forget(&self, id: ObjectId) {
        self.flights.lock().remove(&id);
    }

    pub fn tracked(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_tracked(&self, id: ObjectId) -> bool {
        self.flights.lock().contains(&id)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.flights.lock().clear();
    }
}

impl Domain for ProjectileCleanup {
    type Snapshot = ProjectileInput;
    type Decision = ProjectilePlan;

    fn name(&self) -> &'static str {
        "projectile-cleanup"
    }

    fn snapshot(&self, host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError> {
        if !self.config.enabled {
            return Err(PhaseError::Disabled { domain: self.name() });
        }
        Ok(ProjectileInput {
            now: self.clock.now_ms(),
            projectiles: host.enumerate(&ObjectFilter::kinds(&[ObjectKind::Projectile])),
            players: host.players(),
        })
    }

    fn compute(&self, input: Self::Snapshot) -> Result<Self::Decision, PhaseError> {
        let cfg = &self.config;
        let live: HashMap<ObjectId, &ObjectSnapshot> =
            input.projectiles.iter().map(|p| (p.id, p)).collect();
        let mut plan = ProjectilePlan::default();
        let mut flights = self.flights.lock();
        let mut dropped = Vec::new();

        let ids: Vec<ObjectId> = flights.keys().copied().collect();
        for id in ids {
            let Some(snapshot) = live.get(&id) else {
                dropped.push(id);
                continue;
            };
            let Some(flight) = flights.peek(&id).copied() else {
                continue;
            };
            let moved_sq = flight
                .last_position
                .map(|last| last.distance_squared(snapshot.position));
            let stationary = match moved_sq {
                Some(d) if d <= cfg.stationary_epsilon_sq => flight.stationary + 1,
                _ => 0,
            };
            let age = input.now.saturating_sub(flight.launched_at);
            let slow = snapshot.velocity_sq() < cfg.slow_velocity_sq;
            let expired = (age > cfg.stale_age_ms && (slow || stationary >= cfg.stationary_checks))
                || age > cfg.max_age_ms;

            if expired {
                let watched = any_player_within(
                    &input.players,
                    &snapshot.region,
                    snapshot.position,
                    cfg.occupant_radius,
                );
                if !watched {
                    plan.remove.push(id);
                } else if age > cfg.hard_cap_ms {
                    dropped.push(id);
                    continue;
                }
            }
            if let Some(slot) = flights.get_mut(&id) {
                slot.last_position = Some(snapshot.position);
                slot.stationary = stationary;
            }
        }
        for id in dropped {
            flights.remove(&id);
        }
        Ok(plan)
    }

    fn apply(
        &self,
        host: &mut dyn WorldHost,
        plan: Self::Decision,
    ) -> Result<ApplyReport, PhaseError> {
        let players = host.players();
        let radius = self.config.occupant_radius;
        let live: HashMap<ObjectId, ObjectSnapshot> = host
            .enumerate(&ObjectFilter::kinds(&[ObjectKind::Projectile]))
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let report = apply_each(self.name(), plan.remove, |id| {
            self.flights.lock().remove(id);
            let Some(snapshot) = live.get(id) else {
                return Ok(Applied::Skipped);
            };
            if any_player_within(&players, &snapshot.region, snapshot.position, radius) {
                return Ok(Applied::Skipped);
            }
            host.apply(*id, Mutation::Remove).map(|_| Applied::Done)
        });
        self.removed
            .fetch_add(report.applied as u64, Ordering::Relaxed);
        Ok(report)
    }

    fn is_noop(&self, plan: &Self::Decision) -> bool {
        plan.remove.is_empty()
    }
}
