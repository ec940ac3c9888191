use std::collections::BTreeSet;

use ballast_cache::BoundedLru;
use ballast_common::{
    Mutation, ObjectFilter, ObjectId, ObjectKind, ObjectSnapshot, PlayerView, WorldHost,
};
use ballast_pipeline::{Applied, ApplyReport, Domain, PhaseError, apply_each};
use ballast_telemetry::ScaleReader;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    pub enabled: bool,
    /// Cost trend above which distant items are hidden.
    pub spike_velocity: f64,
    pub view_distance: f64,
    pub period_ms: u64,
    pub capacity: usize,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            spike_velocity: 5.0,
            view_distance: 16.0,
            period_ms: 5_000,
            capacity: 20_000,
        }
    }
}

/// One (item, viewer) pair.
pub type Sighting = (ObjectId, ObjectId);

pub struct VisibilityInput {
    pub velocity: f64,
    pub items: Vec<ObjectSnapshot>,
    pub players: Vec<PlayerView>,
}

#[derive(Debug, Default)]
pub struct VisibilityPlan {
    pub hide: Vec<Sighting>,
    pub show: Vec<Sighting>,
}

/// Hides far-away dropped items from viewers during cost spikes.
pub struct ItemVisibility {
    config: VisibilityConfig,
    scale: ScaleReader,
    hidden: Mutex<BoundedLru<Sighting, ()>>,
}

impl ItemVisibility {
    pub fn new(config: VisibilityConfig, scale: ScaleReader) -> Self {
        let hidden = Mutex::new(BoundedLru::new(config.capacity));
        Self {
            config,
            scale,
            hidden,
        }
    }

    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }

    pub fn hidden_count(&self) -> usize {
        self.hidden.lock().len()
    }

    pub fn is_hidden(&self, item: ObjectId, viewer: ObjectId) -> bool {
        self.hidden.lock().contains(&(item, viewer))
    }

    /// Drop every pair involving `id`, as item or as viewer.
    pub fn forget(&self, id: ObjectId) {
        self.hidden
            .lock()
            .retain(|(item, viewer), _| *item != id && *viewer != id);
    }

    /// Show every hidden item again. Used on stop.
    pub fn show_all(&self, host: &mut dyn WorldHost) -> ApplyReport {
        let pairs: Vec<Sighting> = self.hidden.lock().drain().into_iter().map(|(k, _)| k).collect();
        apply_each("item-show", pairs, |(item, viewer)| {
            host.apply(
                *item,
                Mutation::SetVisibility {
                    viewer: *viewer,
                    visible: true,
                },
            )
            .map(|_| Applied::Done)
        })
    }

    pub fn clear(&self) {
        self.hidden.lock().clear();
    }
}

impl Domain for ItemVisibility {
    type Snapshot = VisibilityInput;
    type Decision = VisibilityPlan;

    fn name(&self) -> &'static str {
        "item-visibility"
    }

    fn snapshot(&self, host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError> {
        if !self.config.enabled {
            return Err(PhaseError::Disabled { domain: self.name() });
        }
        Ok(VisibilityInput {
            velocity: self.scale.velocity(),
            items: host.enumerate(&ObjectFilter::kinds(&[ObjectKind::Item])),
            players: host.players(),
        })
    }

    fn compute(&self, input: Self::Snapshot) -> Result<Self::Decision, PhaseError> {
        let spiking = input.velocity > self.config.spike_velocity;
        let range_sq = self.config.view_distance * self.config.view_distance;
        let mut hidden = self.hidden.lock();
        let mut plan = VisibilityPlan::default();
        let mut live = BTreeSet::new();

        for item in &input.items {
            for viewer in input.players.iter().filter(|p| p.region == item.region) {
                let pair = (item.id, viewer.id);
                live.insert(pair);
                let far = viewer.position.distance_squared(item.position) > range_sq;
                let is_hidden = hidden.contains(&pair);
                if spiking && far && !is_hidden {
                    plan.hide.push(pair);
                } else if is_hidden && (!spiking || !far) {
                    plan.show.push(pair);
                }
            }
        }
        hidden.retain(|pair, _| live.contains(pair));
        Ok(plan)
    }

    fn apply(
        &self,
        host: &mut dyn WorldHost,
        plan: Self::Decision,
    ) -> Result<ApplyReport, PhaseError> {
        let mut report = apply_each(self.name(), plan.show, |(item, viewer)| {
            self.hidden.lock().remove(&(*item, *viewer));
            host.apply(
                *item,
                Mutation::SetVisibility {
                    viewer: *viewer,
                    visible: true,
                },
            )
            .map(|_| Applied::Done)
        });
        report.merge(apply_each(self.name(), plan.hide, |(item, viewer)| {
            host.apply(
                *item,
                Mutation::SetVisibility {
                    viewer: *viewer,
                    visible: false,
                },
            )?;
            self.hidden.lock().put((*item, *viewer), ());
            Ok(Applied::Done)
        }));
        Ok(report)
    }

    fn is_noop(&self, plan: &Self::Decision) -> bool {
        plan.hide.is_empty() && plan.show.is_empty()
    }
}
