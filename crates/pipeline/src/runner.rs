use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ballast_common::{SyncJob, WorldHost};
use serde::Serialize;

use crate::phase::{ApplyReport, Domain, PhaseError};
use crate::scheduler::{Executor, Scheduler, TaskHandle};

/// What [`PhaseRunner::launch`] did.
#[derive(Debug)]
pub enum Launch {
    /// Snapshot taken, compute handed to the pool.
    Started,
    /// A previous cycle of this domain has not finished.
    InFlight,
    Failed(PhaseError),
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    applied: AtomicU64,
}

/// Counters of a runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    /// Completed cycles, including ones with nothing to apply.
    pub cycles: u64,
    /// Launches refused because a cycle was in flight.
    pub skipped: u64,
    pub failures: u64,
    /// Targets mutated across all cycles.
    pub applied: u64,
}

/// Clears the in-flight flag when the cycle's last owner drops it.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one [`Domain`] through snapshot, compute and apply.
///
/// At most one cycle per domain is in flight. The flag is released when the
/// apply job runs, fails, or is dropped by a closed queue.
pub struct PhaseRunner<D: Domain> {
    domain: Arc<D>,
    executor: Executor,
    in_flight: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl<D: Domain> Clone for PhaseRunner<D> {
    fn clone(&self) -> Self {
        Self {
            domain: Arc::clone(&self.domain),
            executor: self.executor.clone(),
            in_flight: Arc::clone(&self.in_flight),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<D: Domain> PhaseRunner<D> {
    pub fn new(domain: Arc<D>, executor: Executor) -> Self {
        Self {
            domain,
            executor,
            in_flight: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn domain(&self) -> &Arc<D> {
        &self.domain
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
        }
    }

    /// Take the snapshot here, compute in the background and queue the
    /// apply back onto the mutation context.
    pub fn launch(&self, host: &dyn WorldHost) -> Launch {
        let name = self.domain.name();
        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(domain = name, "previous cycle still in flight");
            return Launch::InFlight;
        }
        let guard = InFlight(Arc::clone(&self.in_flight));

        let snapshot = {
            let _span = tracing::info_span!("snapshot", domain = name).entered();
            match self.domain.snapshot(host) {
                Ok(s) => s,
                Err(err) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(domain = name, %err, "snapshot phase failed");
                    return Launch::Failed(err);
                }
            }
        };

        let domain = Arc::clone(&self.domain);
        let counters = Arc::clone(&self.counters);
        let executor = self.executor.clone();
        self.executor.spawn(move || {
            let decision = {
                let _span = tracing::info_span!("compute", domain = name).entered();
                match domain.compute(snapshot) {
                    Ok(d) => d,
                    Err(err) => {
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(domain = name, %err, "compute phase failed");
                        return;
                    }
                }
            };
            if domain.is_noop(&decision) {
                counters.cycles.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let job: SyncJob = Box::new(move |host: &mut dyn WorldHost| {
                let _guard = guard;
                let _span = tracing::info_span!("apply", domain = name).entered();
                match domain.apply(host, decision) {
                    Ok(report) => record(&counters, name, report),
                    Err(err) => {
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(domain = name, %err, "apply phase failed");
                    }
                }
            });
            if let Err(err) = executor.submit(job) {
                tracing::debug!(domain = name, %err, "apply dropped");
            }
        });
        Launch::Started
    }

    /// Run all three phases on the calling thread.
    pub fn run_inline(&self, host: &mut dyn WorldHost) -> Result<ApplyReport, PhaseError> {
        let name = self.domain.name();
        let result = self
            .domain
            .snapshot(&*host)
            .and_then(|s| self.domain.compute(s))
            .and_then(|decision| {
                if self.domain.is_noop(&decision) {
                    Ok(ApplyReport::default())
                } else {
                    self.domain.apply(host, decision)
                }
            });
        match &result {
            Ok(report) => record(&self.counters, name, *report),
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(domain = name, %err, "inline cycle failed");
            }
        }
        result
    }

    /// Launch a cycle on the mutation context every `period_ms`.
    pub fn schedule(&self, scheduler: &Scheduler, period_ms: u64) -> TaskHandle {
        let runner = self.clone();
        scheduler.every_sync(self.domain.name(), period_ms, period_ms, move |host| {
            if let Launch::Failed(err) = runner.launch(&*host) {
                tracing::debug!(domain = runner.domain.name(), %err, "cycle not started");
            }
        })
    }
}

fn record(counters: &Counters, name: &'static str, report: ApplyReport) {
    counters.cycles.fetch_add(1, Ordering::Relaxed);
    counters
        .applied
        .fetch_add(report.applied as u64, Ordering::Relaxed);
    if report.total() > 0 {
        tracing::debug!(
            domain = name,
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            "apply phase complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Applied, apply_each};
    use crate::scheduler::SchedulerConfig;
    use ballast_common::{
        ManualClock, Mutation, ObjectFilter, ObjectId, ObjectKind, RegionId,
    };
    use ballast_sim::SimWorld;
    use glam::DVec3;
    use std::time::Duration;

    /// Removes every item lying below y = 0.
    struct VoidSweep;

    impl Domain for VoidSweep {
        type Snapshot = Vec<(ObjectId, f64)>;
        type Decision = Vec<ObjectId>;

        fn name(&self) -> &'static str {
            "void-sweep"
        }

        fn snapshot(&self, host: &dyn WorldHost) -> Result<Self::Snapshot, PhaseError> {
            Ok(host
                .enumerate(&ObjectFilter::kinds(&[ObjectKind::Item]))
                .into_iter()
                .map(|o| (o.id, o.position.y))
                .collect())
        }

        fn compute(&self, snapshot: Self::Snapshot) -> Result<Self::Decision, PhaseError> {
            Ok(snapshot
                .into_iter()
                .filter(|(_, y)| *y < 0.0)
                .map(|(id, _)| id)
                .collect())
        }

        fn apply(
            &self,
            host: &mut dyn WorldHost,
            decision: Self::Decision,
        ) -> Result<ApplyReport, PhaseError> {
            Ok(apply_each(self.name(), decision, |id| {
                host.apply(*id, Mutation::Remove).map(|_| Applied::Done)
            }))
        }

        fn is_noop(&self, decision: &Self::Decision) -> bool {
            decision.is_empty()
        }
    }

    fn world_with_items() -> (SimWorld, ObjectId, ObjectId) {
        let mut world = SimWorld::new();
        let region = RegionId::default();
        let below = world.spawn(ObjectKind::Item, region.clone(), DVec3::new(0.0, -5.0, 0.0));
        let above = world.spawn(ObjectKind::Item, region, DVec3::new(0.0, 64.0, 0.0));
        (world, below, above)
    }

    #[test]
    fn inline_cycle_applies_decision() {
        let (mut world, below, above) = world_with_items();
        let executor = Executor::new(1).unwrap();
        let runner = PhaseRunner::new(Arc::new(VoidSweep), executor);

        let report = runner.run_inline(&mut world).unwrap();
        assert_eq!(report.applied, 1);
        assert!(!world.is_alive(below));
        assert!(world.is_alive(above));
        assert_eq!(runner.stats().cycles, 1);
    }

    #[test]
    fn background_cycle_revalidates_vanished_targets() {
        let (mut world, below, _) = world_with_items();
        let sched = Scheduler::new(&SchedulerConfig::default(), Arc::new(ManualClock::new(0))).unwrap();
        let runner = PhaseRunner::new(Arc::new(VoidSweep), sched.executor());

        assert!(matches!(runner.launch(&world), Launch::Started));
        assert!(matches!(runner.launch(&world), Launch::InFlight));

        // The target disappears between snapshot and apply.
        world.despawn(below);

        for _ in 0..400 {
            sched.on_cycle(&mut world);
            if !runner.is_in_flight() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!runner.is_in_flight());
        let stats = runner.stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.applied, 0);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn closed_queue_releases_in_flight_flag() {
        let (world, _, _) = world_with_items();
        let sched = Scheduler::new(&SchedulerConfig::default(), Arc::new(ManualClock::new(0))).unwrap();
        let runner = PhaseRunner::new(Arc::new(VoidSweep), sched.executor());
        sched.stop();

        assert!(matches!(runner.launch(&world), Launch::Started));
        for _ in 0..400 {
            if !runner.is_in_flight() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!runner.is_in_flight());
    }

    #[test]
    fn scheduled_runner_fires_from_on_cycle() {
        let (mut world, below, _) = world_with_items();
        let clock = Arc::new(ManualClock::new(0));
        let sched = Scheduler::new(&SchedulerConfig::default(), clock.clone()).unwrap();
        let runner = PhaseRunner::new(Arc::new(VoidSweep), sched.executor());
        runner.schedule(&sched, 1_000);

        clock.set(1_000);
        for _ in 0..400 {
            sched.on_cycle(&mut world);
            if !world.is_alive(below) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!world.is_alive(below));
    }
}
