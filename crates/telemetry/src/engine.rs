use std::sync::Arc;

use ballast_common::SyncDispatch;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::curve::{ScaleCurve, ewma};
use crate::registry::{SubscriberRegistry, notify_all};
use crate::timing::TickTelemetry;

/// Load scale engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleConfig {
    /// Sampling period of the background task.
    pub period_ms: u64,
    /// EWMA weight of each new sample.
    pub alpha: f64,
    /// Smoothed value before the first sample.
    pub seed_mspt: f64,
    /// Smallest scale movement that is published.
    pub publish_delta: f64,
    pub curve: ScaleCurve,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            period_ms: 2_000,
            alpha: 0.05,
            seed_mspt: 20.0,
            publish_delta: 0.01,
            curve: ScaleCurve::default(),
        }
    }
}

/// Latest output of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaleSample {
    pub raw_mspt: f64,
    pub smoothed_mspt: f64,
    pub scale: f64,
    pub velocity: f64,
}

impl ScaleSample {
    fn seeded(seed_mspt: f64, curve: &ScaleCurve) -> Self {
        Self {
            raw_mspt: 0.0,
            smoothed_mspt: seed_mspt,
            scale: curve.scale(seed_mspt),
            velocity: 0.0,
        }
    }
}

/// Read-only view of the current [`ScaleSample`].
///
/// Clones share one cell. Only [`LoadScaleEngine`] writes it.
#[derive(Clone)]
pub struct ScaleReader {
    cell: Arc<RwLock<ScaleSample>>,
}

impl ScaleReader {
    pub fn sample(&self) -> ScaleSample {
        *self.cell.read()
    }

    pub fn scale(&self) -> f64 {
        self.cell.read().scale
    }

    pub fn smoothed_mspt(&self) -> f64 {
        self.cell.read().smoothed_mspt
    }

    pub fn velocity(&self) -> f64 {
        self.cell.read().velocity
    }

    fn store(&self, sample: ScaleSample) {
        *self.cell.write() = sample;
    }

    /// Reader pinned to a fixed sample, for wiring subsystems without an
    /// engine.
    pub fn fixed(sample: ScaleSample) -> Self {
        Self {
            cell: Arc::new(RwLock::new(sample)),
        }
    }

    /// Reader pinned to a fixed smoothed cost.
    pub fn fixed_mspt(mspt: f64) -> Self {
        let curve = ScaleCurve::default();
        Self::fixed(ScaleSample {
            raw_mspt: mspt,
            smoothed_mspt: mspt,
            scale: curve.scale(mspt),
            velocity: 0.0,
        })
    }
}

struct EngineState {
    smoothed: f64,
    alpha: f64,
    last_published: Option<f64>,
    publications: u64,
}

/// Turns cycle telemetry into the published load scale.
///
/// One instance per process. [`LoadScaleEngine::sample_and_publish`] is
/// driven by a single periodic task, so publication is serialized.
pub struct LoadScaleEngine {
    config: ScaleConfig,
    telemetry: Arc<TickTelemetry>,
    registry: Arc<SubscriberRegistry>,
    reader: ScaleReader,
    state: Mutex<EngineState>,
}

impl LoadScaleEngine {
    pub fn new(
        config: ScaleConfig,
        telemetry: Arc<TickTelemetry>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        let alpha = if config.alpha > 0.0 && config.alpha <= 1.0 {
            config.alpha
        } else {
            ScaleConfig::default().alpha
        };
        let reader = ScaleReader::fixed(ScaleSample::seeded(config.seed_mspt, &config.curve));
        let state = EngineState {
            smoothed: config.seed_mspt,
            alpha,
            last_published: None,
            publications: 0,
        };
        Self {
            config,
            telemetry,
            registry,
            reader,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &ScaleConfig {
        &self.config
    }

    pub fn reader(&self) -> ScaleReader {
        self.reader.clone()
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<TickTelemetry> {
        &self.telemetry
    }

    /// Fold one raw sample into the smoothed value and return it.
    pub fn update_smoothed(&self, raw: f64) -> f64 {
        let mut state = self.state.lock();
        state.smoothed = ewma(state.smoothed, raw, state.alpha);
        state.smoothed
    }

    /// Change the smoothing weight. Values outside (0, 1] are ignored.
    pub fn set_alpha(&self, alpha: f64) -> bool {
        if !(alpha > 0.0 && alpha <= 1.0) {
            tracing::debug!(alpha, "ignoring out-of-range smoothing weight");
            return false;
        }
        self.state.lock().alpha = alpha;
        true
    }

    pub fn smoothed_mspt(&self) -> f64 {
        self.state.lock().smoothed
    }

    pub fn scale(&self) -> f64 {
        self.reader.scale()
    }

    pub fn publications(&self) -> u64 {
        self.state.lock().publications
    }

    /// Take a telemetry reading and update the shared sample.
    pub fn sample(&self) -> ScaleSample {
        let raw = self.telemetry.average_mspt();
        let velocity = self.telemetry.velocity();
        let smoothed = self.update_smoothed(raw);
        let scale = self.config.curve.scale(smoothed);
        if scale.is_nan() {
            tracing::warn!(raw, smoothed, "scale computation produced NaN, keeping last sample");
            return self.reader.sample();
        }
        let sample = ScaleSample {
            raw_mspt: raw,
            smoothed_mspt: smoothed,
            scale,
            velocity,
        };
        self.reader.store(sample);
        sample
    }

    /// Record `scale` as published if it moved far enough from the last
    /// published value. The first call always publishes.
    pub fn should_publish(&self, scale: f64) -> bool {
        let mut state = self.state.lock();
        let publish = match state.last_published {
            None => true,
            Some(last) => (scale - last).abs() >= self.config.publish_delta,
        };
        if publish {
            state.last_published = Some(scale);
            state.publications += 1;
        }
        publish
    }

    /// Periodic task body. Returns the published scale, if any.
    pub fn sample_and_publish(&self, dispatch: &dyn SyncDispatch) -> Option<f64> {
        let _span = tracing::info_span!("scale_sample").entered();
        let sample = self.sample();
        tracing::trace!(
            raw = sample.raw_mspt,
            smoothed = sample.smoothed_mspt,
            scale = sample.scale,
            velocity = sample.velocity,
            "load sampled"
        );
        if !self.should_publish(sample.scale) {
            return None;
        }
        self.deliver(sample.scale, dispatch);
        Some(sample.scale)
    }

    /// Hand subscribers the new scale on the mutation context, or run them
    /// here if the hand-off fails.
    fn deliver(&self, scale: f64, dispatch: &dyn SyncDispatch) {
        let subscribers = self.registry.snapshot();
        if subscribers.is_empty() {
            return;
        }
        let deferred = subscribers.clone();
        let job = Box::new(move |_: &mut dyn ballast_common::WorldHost| {
            notify_all(&deferred, scale);
        });
        if let Err(err) = dispatch.dispatch(job) {
            tracing::debug!(%err, scale, "scale delivery falling back to direct invocation");
            notify_all(&subscribers, scale);
        }
    }

    /// Forget the last published value so the next sample publishes.
    pub fn reset_publication(&self) {
        self.state.lock().last_published = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_common::{DispatchError, SyncJob};
    use std::time::Duration;

    struct Closed;

    impl SyncDispatch for Closed {
        fn dispatch(&self, _job: SyncJob) -> Result<(), DispatchError> {
            Err(DispatchError::Closed)
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<SyncJob>>);

    impl SyncDispatch for Collect {
        fn dispatch(&self, job: SyncJob) -> Result<(), DispatchError> {
            self.0.lock().push(job);
            Ok(())
        }
    }

    fn engine() -> LoadScaleEngine {
        LoadScaleEngine::new(
            ScaleConfig::default(),
            Arc::new(TickTelemetry::standalone()),
            Arc::new(SubscriberRegistry::new()),
        )
    }

    #[test]
    fn smoothing_is_idempotent_for_zero() {
        let engine = engine();
        assert_eq!(engine.update_smoothed(0.0), 20.0);
        assert_eq!(engine.update_smoothed(-1.0), 20.0);
        assert!((engine.update_smoothed(40.0) - 21.0).abs() < 1e-12);
    }

    #[test]
    fn alpha_outside_unit_interval_is_ignored() {
        let engine = engine();
        assert!(!engine.set_alpha(0.0));
        assert!(!engine.set_alpha(1.5));
        assert!(!engine.set_alpha(f64::NAN));
        assert!(engine.set_alpha(1.0));
        assert_eq!(engine.update_smoothed(80.0), 80.0);
    }

    #[test]
    fn first_value_publishes_then_small_moves_do_not() {
        let engine = engine();
        assert!(engine.should_publish(0.80));
        assert!(!engine.should_publish(0.805));
        assert!(!engine.should_publish(0.795));
        assert!(engine.should_publish(0.78));
        assert!(!engine.should_publish(0.785));
        assert_eq!(engine.publications(), 2);
    }

    #[test]
    fn reset_publication_republishes() {
        let engine = engine();
        assert!(engine.should_publish(0.5));
        engine.reset_publication();
        assert!(engine.should_publish(0.5));
    }

    #[test]
    fn sample_updates_shared_reader() {
        let engine = engine();
        let reader = engine.reader();
        engine.telemetry().record_interval(Duration::from_millis(120));
        let sample = engine.sample();
        assert!((sample.raw_mspt - 120.0).abs() < 1e-9);
        assert!((sample.smoothed_mspt - 25.0).abs() < 1e-9);
        assert_eq!(reader.sample(), sample);
        assert!(reader.scale() < ScaleCurve::default().scale(20.0));
    }

    #[test]
    fn closed_dispatch_falls_back_to_direct_delivery() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.registry().register("probe", move |s| sink.lock().push(s));

        let published = engine.sample_and_publish(&Closed);
        assert!(published.is_some());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn open_dispatch_defers_delivery() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        engine.registry().register("probe", move |_| *sink.lock() += 1);
        engine.telemetry().record_interval(Duration::from_millis(20));

        let queue = Collect::default();
        assert!(engine.sample_and_publish(&queue).is_some());
        assert_eq!(*seen.lock(), 0);
        assert_eq!(queue.0.lock().len(), 1);

        // An unchanged load does not publish again.
        assert!(engine.sample_and_publish(&queue).is_none());
        assert_eq!(queue.0.lock().len(), 1);
    }

    #[test]
    fn fixed_reader_reports_curve_scale() {
        let reader = ScaleReader::fixed_mspt(30.0);
        assert!((reader.scale() - 0.5).abs() < 1e-12);
        assert_eq!(reader.smoothed_mspt(), 30.0);
    }
}
