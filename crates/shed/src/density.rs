//! Entity density (cramming) reduction.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ballast_common::{Mutation, ObjectFilter, ObjectId, ObjectKind, ObjectSnapshot, WorldHost};
use ballast_pipeline::{Applied, ApplyReport, Domain, PhaseError, apply_each};
use ballast_telemetry::{ScaleReader, multiplier_from_scale};
use serde::{Deserialize, Serialize};

use crate::grid::SnapshotGrid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    pub enabled: bool,
    /// Neighbour limit before the scale multiplier.
    pub base_threshold: u32,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    pub radius: f64,
    pub period_ms: u64,
    /// Objects enumerated per run.
    pub max_per_run: usize,
    /// Cost trend that counts as a spike.
    pub spike_velocity: f64,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_threshold: 16,
            min_multiplier: 0.5,
            max_multiplier: 2.0,
            radius: 2.0,
            period_ms: 5_000,
            max_per_run: 500,
            spike_velocity: 5.0,
        }
    }
}

/// Pick objects to remove so no neighbourhood holds more than `threshold`.
///
/// Walks the snapshots in order. Around each surviving object it counts the
/// surviving objects within `radius` (itself included) in the same region.
/// If that count exceeds the threshold, exactly `count - threshold` are
/// chosen: unnamed before named, lower worth first, earlier snapshot first.
/// Players, armor stands and keep-tagged objects are never chosen; the first
/// two are not counted either.
pub fn plan_crowding(snapshots: &[ObjectSnapshot], radius: f64, threshold: usize) -> Vec<ObjectId> {
    let threshold = threshold.max(1);
    let counted = |s: &ObjectSnapshot| !matches!(s.kind, ObjectKind::Player | ObjectKind::ArmorStand);
    let grid = SnapshotGrid::build(snapshots, radius.max(0.5));
    let mut chosen = vec![false; snapshots.len()];
    let mut removals = Vec::new();

    for (index, snapshot) in snapshots.iter().enumerate() {
        if chosen[index] || !counted(snapshot) {
            continue;
        }
        let survivors: Vec<usize> = grid
            .within(snapshots, &snapshot.region, snapshot.position, radius)
            .into_iter()
            .filter(|&j| !chosen[j] && counted(&snapshots[j]))
            .collect();
        if survivors.len() <= threshold {
            continue;
        }
        let excess = survivors.len() - threshold;
        let mut removable: Vec<usize> = survivors
            .into_iter()
            .filter(|&j| !snapshots[j].flags.keep)
            .collect();
        removable.sort_by_key(|&j| (snapshots[j].flags.named, snapshots[j].worth, j));
        for j in removable.into_iter().take(excess) {
            chosen[j] = true;
            removals.push(snapshots[j].id);
        }
    }
    removals
}

/// Cramming reduction domain.
pub struct EntityDensity {
    config: DensityConfig,
    scale: ScaleReader,
    threshold: AtomicU32,
    removed: AtomicU64,
}

impl EntityDensity {
    pub fn new(config: DensityConfig, scale: ScaleReader) -> Self {
        let density = Self {
            threshold: AtomicU32::new(config.base_threshold.max(1)),
            config,
            scale,
            removed: AtomicU64::new(0),
        };
        density.set_scale(density.scale.scale());
        density
    }

    pub fn config(&self) -> &DensityConfig {
        &self.config
    }

    /// Scale subscription.
    pub fn set_scale(&self, scale: f64) {
        let m = multiplier_from_scale(scale, self.config.min_multiplier, self.config.max_multiplier);
        let t = (self.config.base_threshold as f64 * m).round().max(1.0) as u32;
        self.threshold.store(t, Ordering::Relaxed);
    }

    /// Threshold in effect for a run, tightened during a cost spike.
    pub fn effective_threshold(&self, velocity: f64) -> u32 {
        let t = self.threshold.load(Ordering::Relaxed);
        if velocity > self.config.spike_velocity {
            t.min((self.config.base_threshold / 2).max(5))
        } else {
            t
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }
}

pub struct DensityInput {
    pub threshold: u32,
    pub objects: Vec<ObjectSnapshot>,
}

impl Domain for EntityDensity {
    type Snapshot = DensityInput;
    type Decision = Vec<ObjectId>;

    fn name(&self) -> &'static str {
        "entity-density"
    }

    fn snapshot(&self, host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError> {
        if !self.config.enabled {
            return Err(PhaseError::Disabled { domain: self.name() });
        }
        let filter = ObjectFilter::kinds(&[ObjectKind::Mob, ObjectKind::Passive])
            .limit(self.config.max_per_run);
        Ok(DensityInput {
            threshold: self.effective_threshold(self.scale.velocity()),
            objects: host.enumerate(&filter),
        })
    }

    fn compute(&self, input: Self::Snapshot) -> Result<Self::Decision, PhaseError> {
        Ok(plan_crowding(
            &input.objects,
            self.config.radius,
            input.threshold as usize,
        ))
    }

    fn apply(
        &self,
        host: &mut dyn WorldHost,
        removals: Self::Decision,
    ) -> Result<ApplyReport, PhaseError> {
        let report = apply_each(self.name(), removals, |id| {
            if !host.is_alive(*id) {
                return Ok(Applied::Skipped);
            }
            host.apply(*id, Mutation::Remove).map(|_| Applied::Done)
        });
        self.removed
            .fetch_add(report.applied as u64, Ordering::Relaxed);
        if report.applied > 0 {
            tracing::warn!(removed = report.applied, "reduced entity cramming");
        }
        Ok(report)
    }

    fn is_noop(&self, removals: &Self::Decision) -> bool {
        removals.is_empty()
    }
}
