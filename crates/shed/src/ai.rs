use std::collections::BTreeSet;

use ballast_cache::BoundedLru;
use ballast_common::{
    HostError, Mutation, MutationOutcome, ObjectFilter, ObjectId, ObjectKind, ObjectSnapshot,
    PlayerView, WorldHost, nearest_player_distance_sq,
};
use ballast_pipeline::{Applied, ApplyReport, Domain, PhaseError, apply_each};
use ballast_telemetry::{ScaleReader, multiplier_from_scale};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    /// Below this scale the simulation counts as lagging.
    pub high_lag_scale: f64,
    /// Simplification distance at saturation.
    pub near_distance: f64,
    /// Simplification distance when the scale is just under the lag mark.
    pub far_distance: f64,
    /// Objects this close to a player are always restored.
    pub restore_distance: f64,
    pub period_ms: u64,
    pub capacity: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_lag_scale: 0.30,
            near_distance: 32.0,
            far_distance: 64.0,
            restore_distance: 16.0,
            period_ms: 5_000,
            capacity: 5_000,
        }
    }
}

pub struct AiInput {
    pub scale: f64,
    pub objects: Vec<ObjectSnapshot>,
    pub players: Vec<PlayerView>,
}

#[derive(Debug, Default)]
pub struct AiPlan {
    pub simplify: Vec<ObjectId>,
    /// Objects to restore together with their original autonomy.
    pub restore: Vec<(ObjectId, bool)>,
}

/// Turns off autonomous behaviour of far, idle objects while the
/// simulation lags, and restores it exactly afterwards.
pub struct AiSimplifier {
    config: AiConfig,
    scale: ScaleReader,
    /// Simplified objects and their autonomy before simplification.
    simplified: Mutex<BoundedLru<ObjectId, bool>>,
}

impl AiSimplifier {
    pub fn new(config: AiConfig, scale: ScaleReader) -> Self {
        let simplified = Mutex::new(BoundedLru::new(config.capacity));
        Self {
            config,
            scale,
            simplified,
        }
    }

    pub fn config(&self) -> &AiConfig {
        &self.config
    }

    pub fn simplified_count(&self) -> usize {
        self.simplified.lock().len()
    }

    pub fn is_simplified(&self, id: ObjectId) -> bool {
        self.simplified.lock().contains(&id)
    }

    /// Removal or unload: nothing to restore any more.
    pub fn forget(&self, id: ObjectId) {
        self.simplified.lock().remove(&id);
    }

    /// Restore every simplified object. Used on stop.
    pub fn restore_all(&self, host: &mut dyn WorldHost) -> ApplyReport {
        let pending = self.simplified.lock().drain();
        apply_each("ai-restore", pending, |(id, original)| {
            host.apply(*id, Mutation::SetAutonomous(*original))
                .map(|_| Applied::Done)
        })
    }

    pub fn clear(&self) {
        self.simplified.lock().clear();
    }

    /// Squared distance beyond which idle objects are simplified.
    pub fn simplify_distance_sq(&self, scale: f64) -> f64 {
        let near = self.config.near_distance * self.config.near_distance;
        let far = self.config.far_distance * self.config.far_distance;
        multiplier_from_scale(scale, near, far)
    }
}

impl Domain for AiSimplifier {
    type Snapshot = AiInput;
    type Decision = AiPlan;

    fn name(&self) -> &'static str {
        "ai-simplify"
    }

    fn snapshot(&self, host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError> {
        if !self.config.enabled {
            return Err(PhaseError::Disabled { domain: self.name() });
        }
        Ok(AiInput {
            scale: self.scale.scale(),
            objects: host.enumerate(&ObjectFilter::kinds(&[ObjectKind::Mob, ObjectKind::Passive])),
            players: host.players(),
        })
    }

    fn compute(&self, input: Self::Snapshot) -> Result<Self::Decision, PhaseError> {
        let high_lag = input.scale < self.config.high_lag_scale;
        let simplify_sq = self.simplify_distance_sq(input.scale);
        let restore_sq = self.config.restore_distance * self.config.restore_distance;

        let mut simplified = self.simplified.lock();
        let mut plan = AiPlan::default();
        let mut seen = BTreeSet::new();
        for object in &input.objects {
            seen.insert(object.id);
            let nearest = nearest_player_distance_sq(&input.players, &object.region, object.position)
                .unwrap_or(f64::INFINITY);
            match simplified.peek(&object.id).copied() {
                Some(original) => {
                    if !high_lag || object.has_target() || nearest <= restore_sq {
                        plan.restore.push((object.id, original));
                    }
                }
                None => {
                    if high_lag && !object.has_target() && nearest > simplify_sq {
                        plan.simplify.push(object.id);
                    }
                }
            }
        }
        // Objects that left the enumeration no longer need restoring.
        let gone = simplified.retain(|id, _| seen.contains(id));
        if gone > 0 {
            tracing::debug!(gone, "forgot simplified objects no longer present");
        }
        Ok(plan)
    }

    fn apply(
        &self,
        host: &mut dyn WorldHost,
        plan: Self::Decision,
    ) -> Result<ApplyReport, PhaseError> {
        let mut report = apply_each(self.name(), plan.restore, |(id, original)| {
            // Keep the saved flag until the host has taken it back.
            match host.apply(*id, Mutation::SetAutonomous(*original)) {
                Ok(_) => {
                    self.simplified.lock().remove(id);
                    Ok(Applied::Done)
                }
                Err(HostError::NotFound(gone)) => {
                    self.simplified.lock().remove(id);
                    Err(HostError::NotFound(gone))
                }
                Err(err) => Err(err),
            }
        });
        report.merge(apply_each(self.name(), plan.simplify, |id| {
            if !host.is_alive(*id) {
                return Ok(Applied::Skipped);
            }
            let original = match host.apply(*id, Mutation::SetAutonomous(false))? {
                MutationOutcome::PreviousAutonomous(flag) => flag,
                MutationOutcome::Applied => true,
            };
            self.simplified.lock().put(*id, original);
            match host.apply(*id, Mutation::ZeroVelocity) {
                Ok(_) | Err(HostError::Unsupported(_)) => {}
                Err(err) => tracing::debug!(?id, %err, "could not zero velocity"),
            }
            Ok(Applied::Done)
        }));
        if report.applied > 0 {
            tracing::debug!(
                simplified = self.simplified_count(),
                changed = report.applied,
                "ai simplification applied"
            );
        }
        Ok(report)
    }

    fn is_noop(&self, plan: &Self::Decision) -> bool {
        plan.simplify.is_empty() && plan.restore.is_empty()
    }
}
