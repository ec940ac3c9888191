use std::sync::Arc;
use std::time::{Duration, Instant};

use ballast_common::{NoTiming, TimingSource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::window::SampleWindow;

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Samples kept per series.
    pub window: usize,
    /// Reported when nothing else is known.
    pub default_mspt: f64,
    /// Fewest samples a trend is computed from.
    pub velocity_min_samples: usize,
    /// Most recent samples a trend looks at.
    pub velocity_horizon: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window: 120,
            default_mspt: 50.0,
            velocity_min_samples: 6,
            velocity_horizon: 12,
        }
    }
}

/// Where an average came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    Active,
    Interval,
    Host,
    Default,
}

/// Average cycle cost and the series it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub mspt: f64,
    pub source: SampleSource,
}

struct Series {
    interval: SampleWindow,
    active: SampleWindow,
    last_boundary: Option<Instant>,
}

/// Per-cycle timing.
///
/// The host calls [`TickTelemetry::on_cycle`] at every cycle boundary, which
/// feeds the wall-clock `interval` series. Hosts that can measure work-only
/// time per cycle also feed the `active` series through
/// [`TickTelemetry::record_active`]. Readers on other threads see a
/// consistent view through one short lock.
pub struct TickTelemetry {
    config: TelemetryConfig,
    timing: Arc<dyn TimingSource>,
    series: Mutex<Series>,
}

impl TickTelemetry {
    pub fn new(config: TelemetryConfig, timing: Arc<dyn TimingSource>) -> Self {
        let series = Series {
            interval: SampleWindow::new(config.window),
            active: SampleWindow::new(config.window),
            last_boundary: None,
        };
        Self {
            config,
            timing,
            series: Mutex::new(series),
        }
    }

    /// Telemetry with default windows and no host timing capability.
    pub fn standalone() -> Self {
        Self::new(TelemetryConfig::default(), Arc::new(NoTiming))
    }

    pub fn on_cycle(&self) {
        self.record_boundary(Instant::now());
    }

    /// Record a cycle boundary observed at `at`.
    pub fn record_boundary(&self, at: Instant) {
        let mut series = self.series.lock();
        if let Some(prev) = series.last_boundary {
            series.interval.record(at.saturating_duration_since(prev));
        }
        series.last_boundary = Some(at);
    }

    pub fn record_interval(&self, elapsed: Duration) {
        self.series.lock().interval.record(elapsed);
    }

    pub fn record_active(&self, work: Duration) {
        self.series.lock().active.record(work);
    }

    /// Average cycle cost in milliseconds, falling back from the active
    /// series to the interval series, the host estimate and the default.
    pub fn average_mspt(&self) -> f64 {
        self.measure().mspt
    }

    pub fn measure(&self) -> Measurement {
        {
            let series = self.series.lock();
            if let Some(avg) = series.active.average() {
                return Measurement {
                    mspt: as_ms(avg),
                    source: SampleSource::Active,
                };
            }
            if let Some(avg) = series.interval.average() {
                return Measurement {
                    mspt: as_ms(avg),
                    source: SampleSource::Interval,
                };
            }
        }
        if let Some(mspt) = self.host_estimate() {
            return Measurement {
                mspt,
                source: SampleSource::Host,
            };
        }
        Measurement {
            mspt: self.config.default_mspt,
            source: SampleSource::Default,
        }
    }

    fn host_estimate(&self) -> Option<f64> {
        if let Some(avg) = self.timing.recent_cycle_average() {
            let mspt = as_ms(avg);
            if mspt > 0.0 {
                return Some(mspt);
            }
        }
        self.timing
            .ticks_per_second()
            .filter(|tps| tps.is_finite() && *tps > 0.0)
            .map(|tps| 1000.0 / tps)
    }

    /// Short-horizon trend in ms: positive when cycles are getting slower.
    pub fn velocity(&self) -> f64 {
        let series = self.series.lock();
        let source = if series.active.count() >= self.config.velocity_min_samples {
            &series.active
        } else {
            &series.interval
        };
        let recent: Vec<f64> = source
            .newest(self.config.velocity_horizon)
            .map(as_ms)
            .collect();
        drop(series);

        let k = recent.len();
        if k < self.config.velocity_min_samples.max(2) {
            return 0.0;
        }
        let span = (k / 2).min(3);
        let newest = mean(&recent[..span]);
        let previous = mean(&recent[span..2 * span]);
        newest - previous
    }

    /// (interval, active) sample counts.
    pub fn sample_counts(&self) -> (usize, usize) {
        let series = self.series.lock();
        (series.interval.count(), series.active.count())
    }

    pub fn reset(&self) {
        let mut series = self.series.lock();
        series.interval.clear();
        series.active.clear();
        series.last_boundary = None;
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTps(f64);

    impl TimingSource for FixedTps {
        fn ticks_per_second(&self) -> Option<f64> {
            Some(self.0)
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn falls_back_to_default_without_samples() {
        let telemetry = TickTelemetry::standalone();
        let m = telemetry.measure();
        assert_eq!(m.source, SampleSource::Default);
        assert_eq!(m.mspt, 50.0);
    }

    #[test]
    fn falls_back_to_host_rate_estimate() {
        let telemetry = TickTelemetry::new(TelemetryConfig::default(), Arc::new(FixedTps(20.0)));
        let m = telemetry.measure();
        assert_eq!(m.source, SampleSource::Host);
        assert!((m.mspt - 50.0).abs() < 1e-9);

        let broken = TickTelemetry::new(TelemetryConfig::default(), Arc::new(FixedTps(0.0)));
        assert_eq!(broken.measure().source, SampleSource::Default);
    }

    #[test]
    fn interval_series_used_before_active() {
        let telemetry = TickTelemetry::standalone();
        telemetry.record_interval(ms(40));
        telemetry.record_interval(ms(60));
        let m = telemetry.measure();
        assert_eq!(m.source, SampleSource::Interval);
        assert!((m.mspt - 50.0).abs() < 1e-9);

        telemetry.record_active(ms(12));
        let m = telemetry.measure();
        assert_eq!(m.source, SampleSource::Active);
        assert!((m.mspt - 12.0).abs() < 1e-9);
    }

    #[test]
    fn boundaries_produce_interval_samples() {
        let telemetry = TickTelemetry::standalone();
        let start = Instant::now();
        telemetry.record_boundary(start);
        telemetry.record_boundary(start + ms(50));
        telemetry.record_boundary(start + ms(110));
        assert_eq!(telemetry.sample_counts(), (2, 0));
        assert!((telemetry.average_mspt() - 55.0).abs() < 1e-6);
    }

    #[test]
    fn velocity_needs_six_samples() {
        let telemetry = TickTelemetry::standalone();
        for v in [10, 20, 30, 40, 50] {
            telemetry.record_interval(ms(v));
        }
        assert_eq!(telemetry.velocity(), 0.0);
    }

    #[test]
    fn velocity_compares_newest_three_with_previous_three() {
        let telemetry = TickTelemetry::standalone();
        for v in [10, 10, 10, 40, 40, 40] {
            telemetry.record_interval(ms(v));
        }
        assert!((telemetry.velocity() - 30.0).abs() < 1e-9);

        for v in [10, 10, 10] {
            telemetry.record_interval(ms(v));
        }
        assert!((telemetry.velocity() + 30.0).abs() < 1e-9);
    }

    #[test]
    fn velocity_prefers_active_series_once_populated() {
        let telemetry = TickTelemetry::standalone();
        for v in [50, 50, 50, 50, 50, 50] {
            telemetry.record_interval(ms(v));
        }
        for v in [5, 5, 5, 8, 8, 8] {
            telemetry.record_active(ms(v));
        }
        assert!((telemetry.velocity() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_everything() {
        let telemetry = TickTelemetry::standalone();
        telemetry.record_interval(ms(30));
        telemetry.record_active(ms(10));
        telemetry.reset();
        assert_eq!(telemetry.sample_counts(), (0, 0));
    }
}
