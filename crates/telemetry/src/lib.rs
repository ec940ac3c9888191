//! Telemetry: cycle timing, load smoothing and the published scale.
//!
//! # Invariants
//! - Timing windows are bounded; memory does not grow with uptime.
//! - Only [`LoadScaleEngine`] writes the shared [`ScaleSample`].
//! - A scale is published only when it moved by at least the publish delta.
//!
//! # Fallbacks
//! Missing host timing is never an error. The average falls back from the
//! active series to the interval series, then to the host's rate estimate,
//! then to a fixed default.

pub mod curve;
mod engine;
mod registry;
mod timing;
mod window;

pub use curve::{
    ScaleCurve, clamp01, ewma, lerp, lerp_int, multiplier_from_mspt, multiplier_from_scale,
    scale_from_mspt,
};
pub use engine::{LoadScaleEngine, ScaleConfig, ScaleReader, ScaleSample};
pub use registry::{ScaleCallback, Subscriber, SubscriberHandle, SubscriberRegistry, notify_all};
pub use timing::{Measurement, SampleSource, TelemetryConfig, TickTelemetry};
pub use window::SampleWindow;

pub fn crate_info() -> &'static str {
    "ballast-telemetry v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("telemetry"));
    }
}
