//! Shed: the load-shedding subsystems.
//!
//! Each subsystem owns its per-key state behind one lock and exposes two
//! surfaces: synchronous event hooks the host calls inline, and a
//! [`ballast_pipeline::Domain`] implementation for its periodic scan.
//! Operating points follow the published scale through `set_scale`.
//!
//! # Invariants
//! - No lock is held across a host call.
//! - Every per-key map is bounded by a TTL sweep or an LRU capacity.
//! - A player within a subsystem's occupant radius blocks culls and removals
//!   that player could notice.

pub mod ai;
pub mod density;
pub mod device;
pub mod explosion;
pub mod grid;
pub mod horizon;
pub mod merge;
pub mod particle;
pub mod projectile;
pub mod recent;
pub mod throughput;
pub mod tracker;
pub mod visibility;

pub use ai::{AiConfig, AiSimplifier};
pub use density::{DensityConfig, EntityDensity, plan_crowding};
pub use device::{DeviceConfig, DeviceCulling, DeviceExpiry, DeviceStats};
pub use explosion::{
    ExplosionCause, ExplosionConfig, ExplosionEvent, ExplosionStats, ExplosionThrottle,
    ExplosionVerdict, Origin, Primer, Severity,
};
pub use grid::{CellCoord, SnapshotGrid};
pub use horizon::{HorizonConfig, HorizonController, Horizons};
pub use merge::{ItemMerge, MergeConfig, MergeGroup, MergeKind};
pub use particle::{ParticleConfig, ParticleCulling};
pub use projectile::{ProjectileCleanup, ProjectileConfig};
pub use recent::{RecentActionTracker, RecentConfig, RecentStats};
pub use throughput::{
    DenyReason, ThroughputConfig, ThroughputLimiter, TransferRequest, TransferVerdict,
};
pub use tracker::{ActivityRecord, Candidate, CullPolicy, CullState, CullTracker, TrackerStats};
pub use visibility::{ItemVisibility, VisibilityConfig};

pub fn crate_info() -> &'static str {
    "ballast-shed v0.1.0"
}
