//! Dropped item and experience orb merging.
//!
//! Nearby compatible stacks are folded into one object. Apply removes the
//! sources first and credits the target with only what was really removed,
//! so a source that vanished in between never duplicates anything.

use std::sync::atomic::{AtomicU64, Ordering};

use ballast_common::{
    HostError, Mutation, ObjectFilter, ObjectId, ObjectKind, ObjectSnapshot, PlayerView, WorldHost,
    any_player_within,
};
use ballast_pipeline::{Applied, ApplyReport, Domain, PhaseError, apply_each};
use serde::{Deserialize, Serialize};

use crate::grid::SnapshotGrid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub enabled: bool,
    pub cell_size: f64,
    pub item_radius: f64,
    pub orb_radius: f64,
    /// Items this close to a player are left for pickup.
    pub player_clearance: f64,
    pub period_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cell_size: 4.0,
            item_radius: 3.0,
            orb_radius: 2.0,
            player_clearance: 1.5,
            period_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Items,
    Orbs,
}

/// One target absorbing a set of sources.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeGroup {
    pub kind: MergeKind,
    pub target: ObjectId,
    /// Amount (or experience) held by the target at snapshot time.
    pub base: u32,
    pub sources: Vec<(ObjectId, u32)>,
}

impl MergeGroup {
    pub fn planned_total(&self) -> u32 {
        self.sources
            .iter()
            .fold(self.base, |acc, (_, amount)| acc.saturating_add(*amount))
    }
}

/// Plan item merges. Stacks must match, fit the max stack together and keep
/// clear of players.
pub fn plan_item_merges(
    items: &[ObjectSnapshot],
    players: &[PlayerView],
    config: &MergeConfig,
) -> Vec<MergeGroup> {
    let grid = SnapshotGrid::build(items, config.cell_size);
    let clear = |s: &ObjectSnapshot| {
        !any_player_within(players, &s.region, s.position, config.player_clearance)
    };
    let mut consumed = vec![false; items.len()];
    let mut groups = Vec::new();

    for (i, target) in items.iter().enumerate() {
        if consumed[i] {
            continue;
        }
        let Some(stack) = target.item() else {
            continue;
        };
        if stack.amount >= stack.max_stack || !clear(target) {
            continue;
        }
        let mut total = stack.amount;
        let mut sources = Vec::new();
        for j in grid.within(items, &target.region, target.position, config.item_radius) {
            if j == i || consumed[j] {
                continue;
            }
            let Some(other) = items[j].item() else {
                continue;
            };
            if !stack.stacks_with(other) || total + other.amount > stack.max_stack {
                continue;
            }
            if !clear(&items[j]) {
                continue;
            }
            consumed[j] = true;
            total += other.amount;
            sources.push((items[j].id, other.amount));
        }
        if !sources.is_empty() {
            consumed[i] = true;
            groups.push(MergeGroup {
                kind: MergeKind::Items,
                target: target.id,
                base: stack.amount,
                sources,
            });
        }
    }
    groups
}

/// Plan orb merges: every orb within range folds into the first one seen.
pub fn plan_orb_merges(orbs: &[ObjectSnapshot], config: &MergeConfig) -> Vec<MergeGroup> {
    let grid = SnapshotGrid::build(orbs, config.cell_size);
    let mut consumed = vec![false; orbs.len()];
    let mut groups = Vec::new();

    for (i, target) in orbs.iter().enumerate() {
        if consumed[i] {
            continue;
        }
        let Some(base) = target.experience() else {
            continue;
        };
        let mut sources = Vec::new();
        for j in grid.within(orbs, &target.region, target.position, config.orb_radius) {
            if j == i || consumed[j] {
                continue;
            }
            if let Some(xp) = orbs[j].experience() {
                consumed[j] = true;
                sources.push((orbs[j].id, xp));
            }
        }
        if !sources.is_empty() {
            consumed[i] = true;
            groups.push(MergeGroup {
                kind: MergeKind::Orbs,
                target: target.id,
                base,
                sources,
            });
        }
    }
    groups
}

pub struct MergeInput {
    pub items: Vec<ObjectSnapshot>,
    pub orbs: Vec<ObjectSnapshot>,
    pub players: Vec<PlayerView>,
}

pub struct ItemMerge {
    config: MergeConfig,
    merged: AtomicU64,
}

impl ItemMerge {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            merged: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Source objects folded away since start.
    pub fn merged_total(&self) -> u64 {
        self.merged.load(Ordering::Relaxed)
    }

    fn apply_group(&self, host: &mut dyn WorldHost, group: &MergeGroup) -> Result<Applied, HostError> {
        if !host.is_alive(group.target) {
            return Ok(Applied::Skipped);
        }
        let mut credited = 0u32;
        let mut removed = 0u64;
        for (source, amount) in &group.sources {
            match host.apply(*source, Mutation::Remove) {
                Ok(_) => {
                    credited = credited.saturating_add(*amount);
                    removed += 1;
                }
                Err(err) => tracing::debug!(?source, %err, "merge source not removed"),
            }
        }
        if removed == 0 {
            return Ok(Applied::Skipped);
        }
        let total = group.base.saturating_add(credited);
        let mutation = match group.kind {
            MergeKind::Items => Mutation::SetItemAmount(total),
            MergeKind::Orbs => Mutation::SetExperience(total),
        };
        host.apply(group.target, mutation)?;
        self.merged.fetch_add(removed, Ordering::Relaxed);
        Ok(Applied::Done)
    }
}

impl Domain for ItemMerge {
    type Snapshot = MergeInput;
    type Decision = Vec<MergeGroup>;

    fn name(&self) -> &'static str {
        "item-merge"
    }

    fn snapshot(&self, host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError> {
        if !self.config.enabled {
            return Err(PhaseError::Disabled { domain: self.name() });
        }
        Ok(MergeInput {
            items: host.enumerate(&ObjectFilter::kinds(&[ObjectKind::Item])),
            orbs: host.enumerate(&ObjectFilter::kinds(&[ObjectKind::ExperienceOrb])),
            players: host.players(),
        })
    }

    fn compute(&self, input: Self::Snapshot) -> Result<Self::Decision, PhaseError> {
        let mut groups = plan_item_merges(&input.items, &input.players, &self.config);
        groups.extend(plan_orb_merges(&input.orbs, &self.config));
        Ok(groups)
    }

    fn apply(
        &self,
        host: &mut dyn WorldHost,
        groups: Self::Decision,
    ) -> Result<ApplyReport, PhaseError> {
        let report = apply_each(self.name(), groups, |group| self.apply_group(host, group));
        if report.applied > 0 {
            tracing::debug!(groups = report.applied, "merged dropped objects");
        }
        Ok(report)
    }

    fn is_noop(&self, groups: &Self::Decision) -> bool {
        groups.is_empty()
    }
}
