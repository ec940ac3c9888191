//! Bounded per-key maps.
//!
//! Every map a long-running controller keeps per spatial key or per object
//! must stay finite no matter how long the host runs. Three shapes cover
//! every use:
//!
//! - [`TtlMap`]: entries age out after a fixed time since their stamp.
//! - [`DeadlineMap`]: each key carries its own future deadline.
//! - [`BoundedLru`]: fixed capacity, least recently used evicted first.
//!
//! # Invariants
//! - `len()` never exceeds the configured capacity.
//! - Timestamps are caller-supplied milliseconds; the maps never read a clock.

mod deadline;
mod lru_map;
mod ttl;

pub use deadline::DeadlineMap;
pub use lru_map::BoundedLru;
pub use ttl::TtlMap;

pub fn crate_info() -> &'static str {
    "ballast-cache v0.1.0"
}
