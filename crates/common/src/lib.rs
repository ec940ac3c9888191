//! Common: identity, spatial keys, object snapshots and the host boundary.
//!
//! Everything the controller knows about the simulation flows through the
//! types in this crate. Snapshots are plain data; the live world is only
//! reachable through [`WorldHost`] on the mutation context.
//!
//! # Invariants
//! - [`SpatialKey`] is immutable and hashes by a value memoized at construction.
//! - Region names are interned, so equal names share one allocation.
//! - [`ObjectSnapshot`] holds no reference into live simulation state.

mod clock;
mod host;
mod key;
mod types;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use host::{
    DispatchError, HostError, Mutation, MutationOutcome, NoTiming, ObjectFilter, SyncDispatch,
    SyncJob, TimingSource, WorldHost, WorldMutation,
};
pub use key::{RegionId, SpatialKey};
pub use types::{
    ItemStack, ObjectFlags, ObjectId, ObjectKind, ObjectSnapshot, PlayerView, SnapshotDetail,
    any_player_within, nearest_player_distance_sq,
};

pub fn crate_info() -> &'static str {
    "ballast-common v0.1.0"
}
