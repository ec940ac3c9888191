//! Sim: an in-memory reference host.
//!
//! Implements [`ballast_common::WorldHost`] over a deterministic object
//! store so the controller can be exercised without a real simulation.
//!
//! # Invariants
//! - All state mutations flow through explicit operations and are logged.
//! - Enumeration order is deterministic (BTreeMap).

pub mod world;

pub use world::{HostEvent, SimObject, SimWorld};
