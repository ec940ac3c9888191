//! Pipeline: the snapshot, compute and apply execution pattern.
//!
//! The host owns one mutation thread and calls [`Scheduler::on_cycle`] once
//! per cycle. Everything else in the controller reaches the live world only
//! through work queued for that call.
//!
//! # Invariants
//! - Snapshot and apply run on the mutation context; compute never does.
//! - A domain has at most one cycle in flight.
//! - One failed target never aborts the rest of an apply batch.
//! - After [`Scheduler::stop`] no timer fires and no queued job runs.

mod phase;
mod queue;
mod runner;
mod scheduler;

pub use phase::{Applied, ApplyReport, Domain, PhaseError, apply_each};
pub use queue::MutationQueue;
pub use runner::{Launch, PhaseRunner, RunnerStats};
pub use scheduler::{Executor, Scheduler, SchedulerConfig, SchedulerError, TaskHandle};

pub fn crate_info() -> &'static str {
    "ballast-pipeline v0.1.0"
}
