//! Runtime: the controller that wires telemetry, the shedding subsystems and
//! the safety check to a host.
//!
//! # Lifecycle
//! [`Controller::start`] registers scale subscriptions and every periodic
//! task, then starts the timer thread. [`Controller::stop`] cancels them,
//! hands back simplified and hidden objects, refreshes culled cells and
//! clears every per-key map. A stopped controller can be started again.

mod config;
mod controller;
mod debug;

pub use config::{ConfigError, ControllerConfig};
pub use controller::{Controller, ControllerError};
pub use debug::DebugState;

pub fn crate_info() -> &'static str {
    "ballast-runtime v0.1.0"
}
