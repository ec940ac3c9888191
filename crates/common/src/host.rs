use std::time::Duration;

use crate::key::{RegionId, SpatialKey};
use crate::types::{ObjectId, ObjectKind, ObjectSnapshot, PlayerView};

/// Errors from host calls. All of them are transient from the controller's
/// point of view: the affected key or object is skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostError {
    #[error("object {0:?} not found")]
    NotFound(ObjectId),
    #[error("host does not support {0}")]
    Unsupported(&'static str),
    #[error("host rejected mutation: {0}")]
    Rejected(String),
}

/// Selects which live objects a snapshot phase enumerates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectFilter {
    pub kinds: Vec<ObjectKind>,
    pub region: Option<RegionId>,
    /// Upper bound on returned objects, the snapshot phase's budget.
    pub limit: Option<usize>,
}

impl ObjectFilter {
    pub fn kinds(kinds: &[ObjectKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            ..Self::default()
        }
    }

    pub fn in_region(mut self, region: RegionId) -> Self {
        self.region = Some(region);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, kind: ObjectKind, region: &RegionId) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&kind))
            && self.region.as_ref().is_none_or(|r| r == region)
    }
}

/// A change to one live object.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Remove,
    /// Enable or disable autonomous behaviour. Reports the previous flag.
    SetAutonomous(bool),
    ClearTarget,
    ZeroVelocity,
    SetItemAmount(u32),
    SetExperience(u32),
    /// Show or hide this object for one viewer.
    SetVisibility { viewer: ObjectId, visible: bool },
}

/// Result of a successful [`Mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    PreviousAutonomous(bool),
}

/// A change to world-level state rather than a single object.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldMutation {
    /// Re-run the host's update for a cell, releasing suppressed work.
    RefreshCell(SpatialKey),
    SetHorizons { view: u32, simulation: u32 },
}

/// The live simulation, reachable only from the mutation context.
///
/// Adapters implement this over the real host. Every method is called on the
/// simulation's own thread; none of them may block on background work.
pub trait WorldHost {
    /// Copy every live object matching `filter` into plain snapshots.
    fn enumerate(&self, filter: &ObjectFilter) -> Vec<ObjectSnapshot>;

    fn players(&self) -> Vec<PlayerView>;

    fn is_alive(&self, id: ObjectId) -> bool;

    fn apply(&mut self, id: ObjectId, mutation: Mutation) -> Result<MutationOutcome, HostError>;

    fn apply_world(&mut self, mutation: WorldMutation) -> Result<(), HostError> {
        let _ = mutation;
        Err(HostError::Unsupported("world mutations"))
    }

    fn broadcast(&mut self, message: &str);

    /// Persist world state ahead of a forced shutdown.
    fn save_all(&mut self) -> Result<(), HostError>;

    fn disconnect_all(&mut self, reason: &str);

    fn shutdown_host(&mut self);
}

/// Optional high-resolution timing the host may expose.
///
/// Hosts without it use [`NoTiming`]; the telemetry then relies on its own
/// interval measurements.
pub trait TimingSource: Send + Sync {
    /// Host-maintained average cycle time, if tracked.
    fn recent_cycle_average(&self) -> Option<Duration> {
        None
    }

    fn ticks_per_second(&self) -> Option<f64> {
        None
    }
}

/// Timing capability for hosts that expose nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTiming;

impl TimingSource for NoTiming {}

/// Work queued for the mutation context.
pub type SyncJob = Box<dyn FnOnce(&mut dyn WorldHost) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("mutation queue is closed")]
    Closed,
}

/// Hands work to the mutation context.
pub trait SyncDispatch: Send + Sync {
    fn dispatch(&self, job: SyncJob) -> Result<(), DispatchError>;
}
