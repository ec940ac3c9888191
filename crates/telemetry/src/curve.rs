//! Scale math: smoothing, the logistic load curve and interpolation helpers.
//!
//! Every subsystem turns the published scale into its own operating point
//! through [`multiplier_from_scale`] or [`lerp_int`].

use serde::{Deserialize, Serialize};

/// Logistic mapping from milliseconds per cycle to a scale in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleCurve {
    /// Cost at which the scale crosses 0.5.
    pub midpoint_mspt: f64,
    pub steepness: f64,
}

impl Default for ScaleCurve {
    fn default() -> Self {
        Self {
            midpoint_mspt: 30.0,
            steepness: 0.20,
        }
    }
}

impl ScaleCurve {
    /// 1.0 for idle (or non-positive input), approaching 0.0 as cost grows.
    pub fn scale(&self, mspt: f64) -> f64 {
        if mspt.is_nan() || mspt <= 0.0 {
            return 1.0;
        }
        let v = 1.0 / (1.0 + (self.steepness * (mspt - self.midpoint_mspt)).exp());
        clamp01(v)
    }
}

/// Scale for a cost using the default curve.
pub fn scale_from_mspt(mspt: f64) -> f64 {
    ScaleCurve::default().scale(mspt)
}

/// One EWMA step. Non-positive or non-finite samples leave `prev` unchanged.
pub fn ewma(prev: f64, raw: f64, alpha: f64) -> f64 {
    if !raw.is_finite() || raw <= 0.0 {
        return prev;
    }
    raw * alpha + prev * (1.0 - alpha)
}

pub fn clamp01(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * clamp01(t)
}

/// Rounded interpolation between two integer bounds.
pub fn lerp_int(a: i32, b: i32, t: f64) -> i32 {
    lerp(a as f64, b as f64, t).round() as i32
}

/// `min` at saturation, `max` at idle. A NaN scale maps to a neutral 1.0.
pub fn multiplier_from_scale(scale: f64, min: f64, max: f64) -> f64 {
    if scale.is_nan() {
        return 1.0;
    }
    min + (max - min) * clamp01(scale)
}

pub fn multiplier_from_mspt(mspt: f64, min: f64, max: f64) -> f64 {
    multiplier_from_scale(scale_from_mspt(mspt), min, max)
}
