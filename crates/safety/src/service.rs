use std::sync::{Arc, Weak};

use ballast_common::{SyncJob, WorldHost};
use ballast_pipeline::{Executor, Scheduler, TaskHandle};
use ballast_telemetry::ScaleReader;
use parking_lot::Mutex;

use crate::controller::{SafetyAction, SafetyConfig, SafetyController, SafetyMetric, SafetyPhase, SafetyStats};

/// Runs the [`SafetyController`] on a background timer and carries its
/// actions onto the mutation context.
pub struct SafetyService {
    controller: Mutex<SafetyController>,
    reader: ScaleReader,
    metric: SafetyMetric,
}

impl SafetyService {
    pub fn new(config: SafetyConfig, reader: ScaleReader) -> Self {
        let metric = config.metric;
        Self {
            controller: Mutex::new(SafetyController::new(config)),
            reader,
            metric,
        }
    }

    pub fn reading(&self) -> f64 {
        let sample = self.reader.sample();
        match self.metric {
            SafetyMetric::Smoothed => sample.smoothed_mspt,
            SafetyMetric::Raw => sample.raw_mspt,
        }
    }

    pub fn phase(&self) -> SafetyPhase {
        self.controller.lock().phase()
    }

    pub fn stats(&self) -> SafetyStats {
        self.controller.lock().stats()
    }

    /// One check: read the metric and return what must happen.
    pub fn check(&self) -> Vec<SafetyAction> {
        let reading = self.reading();
        self.controller.lock().check(reading)
    }

    /// Register the periodic check. Timer cancellation goes through a weak
    /// reference so the scheduler never keeps itself alive.
    pub fn start(self: &Arc<Self>, scheduler: &Arc<Scheduler>) -> Option<TaskHandle> {
        let period = {
            let controller = self.controller.lock();
            if !controller.config.enabled {
                tracing::info!("safety controller disabled");
                return None;
            }
            controller.config.check_period_ms
        };
        let service = Arc::clone(self);
        let weak: Weak<Scheduler> = Arc::downgrade(scheduler);
        let executor = scheduler.executor();
        let handle = scheduler.every_async("safety-check", period, period, move || {
            let actions = service.check();
            if !actions.is_empty() {
                dispatch(&weak, &executor, actions);
            }
        });
        Some(handle)
    }

    pub fn reset(&self) {
        self.controller.lock().reset();
    }
}

fn dispatch(scheduler: &Weak<Scheduler>, executor: &Executor, actions: Vec<SafetyAction>) {
    let mut host_actions = Vec::new();
    for action in actions {
        match action {
            SafetyAction::CancelTimers => {
                if let Some(scheduler) = scheduler.upgrade() {
                    let cancelled = scheduler.cancel_all();
                    tracing::warn!(cancelled, "all timers cancelled for shutdown");
                }
            }
            other => host_actions.push(other),
        }
    }
    if host_actions.is_empty() {
        return;
    }
    let job: SyncJob = Box::new(move |host: &mut dyn WorldHost| {
        for action in &host_actions {
            perform(host, action);
        }
    });
    if let Err(err) = executor.submit(job) {
        tracing::error!(%err, "safety actions could not be queued");
    }
}

/// Carry out one action on the host.
pub fn perform(host: &mut dyn WorldHost, action: &SafetyAction) {
    match action {
        SafetyAction::Broadcast(message) => host.broadcast(message),
        SafetyAction::CancelTimers => {}
        SafetyAction::Finalize { reason } => finalize(host, reason),
    }
}

/// Save, disconnect, terminate. Each step runs even if the one before failed.
pub fn finalize(host: &mut dyn WorldHost, reason: &str) {
    tracing::error!(%reason, "finalizing forced shutdown");
    if let Err(err) = host.save_all() {
        tracing::warn!(%err, "save before shutdown failed");
    }
    host.disconnect_all(reason);
    host.shutdown_host();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_common::ManualClock;
    use ballast_pipeline::SchedulerConfig;
    use ballast_sim::{HostEvent, SimWorld};
    use ballast_telemetry::{ScaleSample, scale_from_mspt};
    use std::time::Duration;

    fn reader(raw: f64, smoothed: f64) -> ScaleReader {
        ScaleReader::fixed(ScaleSample {
            raw_mspt: raw,
            smoothed_mspt: smoothed,
            scale: scale_from_mspt(smoothed),
            velocity: 0.0,
        })
    }

    #[test]
    fn metric_selects_the_reading() {
        let smoothed = SafetyService::new(SafetyConfig::default(), reader(300.0, 40.0));
        assert_eq!(smoothed.reading(), 40.0);
        let raw = SafetyService::new(
            SafetyConfig {
                metric: SafetyMetric::Raw,
                ..SafetyConfig::default()
            },
            reader(300.0, 40.0),
        );
        assert_eq!(raw.reading(), 300.0);
        assert!(matches!(raw.check()[0], SafetyAction::CancelTimers));
    }

    #[test]
    fn finalize_runs_every_step_in_order() {
        let mut world = SimWorld::new();
        world.add_player("p", Default::default(), Default::default());
        finalize(&mut world, "bye");
        let tail: Vec<_> = world.events().iter().rev().take(3).cloned().collect();
        assert_eq!(
            tail,
            vec![
                HostEvent::Shutdown,
                HostEvent::Disconnected { reason: "bye".into() },
                HostEvent::Saved,
            ]
        );
        assert!(world.is_shut_down());
        assert_eq!(world.player_count(), 0);
    }

    #[test]
    fn extreme_load_shuts_the_host_down() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(Scheduler::new(&SchedulerConfig::default(), clock.clone()).unwrap());
        let other = scheduler.every_sync("other", 1_000, 1_000, |_| {});
        let service = Arc::new(SafetyService::new(SafetyConfig::default(), reader(0.0, 250.0)));
        service.start(&scheduler).unwrap();
        assert_eq!(scheduler.timer_count(), 2);

        clock.set(1_000);
        scheduler.poll_async();
        let mut world = SimWorld::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !world.is_shut_down() && std::time::Instant::now() < deadline {
            scheduler.on_cycle(&mut world);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(world.is_shut_down());
        assert_eq!(scheduler.timer_count(), 0);
        assert!(!scheduler.cancel(other));
        assert_eq!(service.phase(), SafetyPhase::Finalized);
    }

    #[test]
    fn disabled_service_registers_nothing() {
        let clock = Arc::new(ManualClock::new(0));
        let scheduler = Arc::new(Scheduler::new(&SchedulerConfig::default(), clock).unwrap());
        let service = Arc::new(SafetyService::new(
            SafetyConfig {
                enabled: false,
                ..SafetyConfig::default()
            },
            reader(0.0, 250.0),
        ));
        assert!(service.start(&scheduler).is_none());
        assert_eq!(scheduler.timer_count(), 0);
    }
}
