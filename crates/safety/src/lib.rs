//! Safety: the last line of defence against runaway load.
//!
//! Watches the load metric on its own timer, independent of every shedding
//! subsystem, and escalates in three tiers:
//!
//! 1. warn: one broadcast per excursion above the warn tier;
//! 2. countdown: after consecutive readings above the countdown tier, a
//!    visible countdown that one good reading aborts;
//! 3. immediate: cancel every timer and shut the host down.
//!
//! # Invariants
//! - Finalization happens at most once.
//! - Non-finite or negative readings never escalate.

mod controller;
mod service;

pub use controller::{
    SafetyAction, SafetyConfig, SafetyController, SafetyMetric, SafetyPhase, SafetyStats,
};
pub use service::{SafetyService, finalize, perform};

pub fn crate_info() -> &'static str {
    "ballast-safety v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("safety"));
    }
}
