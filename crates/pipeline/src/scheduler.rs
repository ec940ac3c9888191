use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use ballast_common::{Clock, DispatchError, SyncJob, WorldHost};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::queue::MutationQueue;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Background worker threads.
    pub workers: usize,
    /// Most mutation jobs run per host cycle.
    pub batch_limit: usize,
    /// Granularity of the asynchronous timer thread.
    pub resolution_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_limit: 100,
            resolution_ms: 50,
        }
    }
}

/// Errors from scheduler setup.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to spawn timer thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Cheap handle to the worker pool and the mutation queue.
#[derive(Clone)]
pub struct Executor {
    pool: Arc<ThreadPool>,
    queue: MutationQueue,
}

impl Executor {
    pub fn new(workers: usize) -> Result<Self, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("ballast-worker-{i}"))
            .panic_handler(|_| tracing::error!("background task panicked"))
            .build()?;
        Ok(Self {
            pool: Arc::new(pool),
            queue: MutationQueue::new(),
        })
    }

    /// Run `job` on a background worker.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        self.pool.spawn(job);
    }

    /// Queue `job` for the mutation context.
    pub fn submit(&self, job: SyncJob) -> Result<(), DispatchError> {
        self.queue.submit(job)
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }
}

/// Identifies a registered periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

type AsyncTask = Arc<dyn Fn() + Send + Sync>;
type SyncTask = Arc<dyn Fn(&mut dyn WorldHost) + Send + Sync>;

enum TaskBody {
    Async(AsyncTask),
    Sync(SyncTask),
}

struct Timer {
    handle: TaskHandle,
    name: &'static str,
    period_ms: u64,
    next_due: u64,
    body: TaskBody,
    running: Arc<AtomicBool>,
}

/// Clears a timer's running flag when its run ends, even by panic.
struct Running(Arc<AtomicBool>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Core {
    clock: Arc<dyn Clock>,
    executor: Executor,
    timers: Mutex<Vec<Timer>>,
    next_id: AtomicU64,
    batch_limit: usize,
    stopped: AtomicBool,
}

impl Core {
    fn poll_async(&self) -> usize {
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }
        let now = self.clock.now_ms();
        let mut due = Vec::new();
        {
            let mut timers = self.timers.lock();
            for timer in timers.iter_mut() {
                let TaskBody::Async(task) = &timer.body else {
                    continue;
                };
                if now < timer.next_due {
                    continue;
                }
                timer.next_due = now + timer.period_ms;
                if timer.running.swap(true, Ordering::AcqRel) {
                    tracing::trace!(task = timer.name, "previous run still active, skipping");
                    continue;
                }
                due.push((timer.name, Arc::clone(task), Arc::clone(&timer.running)));
            }
        }
        let fired = due.len();
        for (name, task, running) in due {
            self.executor.spawn(move || {
                let _running = Running(running);
                let _span = tracing::debug_span!("timer", task = name).entered();
                task();
            });
        }
        fired
    }

    fn poll_sync(&self, host: &mut dyn WorldHost) -> usize {
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }
        let now = self.clock.now_ms();
        let due: Vec<(&'static str, SyncTask)> = {
            let mut timers = self.timers.lock();
            timers
                .iter_mut()
                .filter_map(|timer| match &timer.body {
                    TaskBody::Sync(task) if now >= timer.next_due => {
                        timer.next_due = now + timer.period_ms;
                        Some((timer.name, Arc::clone(task)))
                    }
                    _ => None,
                })
                .collect()
        };
        let fired = due.len();
        for (name, task) in due {
            if catch_unwind(AssertUnwindSafe(|| task(&mut *host))).is_err() {
                tracing::error!(task = name, "synchronous timer panicked");
            }
        }
        fired
    }
}

/// Periodic tasks on two contexts.
///
/// Synchronous timers run inside [`Scheduler::on_cycle`] on the host's
/// mutation thread. Asynchronous timers are fired by a dedicated timer
/// thread onto the worker pool; a run is skipped while the previous one is
/// still executing. Timers self-reschedule one period after they fire, so
/// missed periods collapse into one run.
pub struct Scheduler {
    core: Arc<Core>,
    resolution: Duration,
    thread: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> Result<Self, SchedulerError> {
        let executor = Executor::new(config.workers)?;
        let core = Core {
            clock,
            executor,
            timers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            batch_limit: config.batch_limit.max(1),
            stopped: AtomicBool::new(false),
        };
        Ok(Self {
            core: Arc::new(core),
            resolution: Duration::from_millis(config.resolution_ms.max(1)),
            thread: Mutex::new(None),
        })
    }

    pub fn executor(&self) -> Executor {
        self.core.executor.clone()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.core.clock
    }

    fn add(&self, name: &'static str, delay_ms: u64, period_ms: u64, body: TaskBody) -> TaskHandle {
        let handle = TaskHandle(self.core.next_id.fetch_add(1, Ordering::Relaxed));
        let next_due = self.core.clock.now_ms() + delay_ms;
        self.core.timers.lock().push(Timer {
            handle,
            name,
            period_ms: period_ms.max(1),
            next_due,
            body,
            running: Arc::new(AtomicBool::new(false)),
        });
        tracing::debug!(task = name, delay_ms, period_ms, "timer registered");
        handle
    }

    /// Run `job` on the worker pool every `period_ms`, first after `delay_ms`.
    pub fn every_async(
        &self,
        name: &'static str,
        delay_ms: u64,
        period_ms: u64,
        job: impl Fn() + Send + Sync + 'static,
    ) -> TaskHandle {
        self.add(name, delay_ms, period_ms, TaskBody::Async(Arc::new(job)))
    }

    /// Run `job` on the mutation context every `period_ms`, first after
    /// `delay_ms`.
    pub fn every_sync(
        &self,
        name: &'static str,
        delay_ms: u64,
        period_ms: u64,
        job: impl Fn(&mut dyn WorldHost) + Send + Sync + 'static,
    ) -> TaskHandle {
        self.add(name, delay_ms, period_ms, TaskBody::Sync(Arc::new(job)))
    }

    pub fn cancel(&self, handle: TaskHandle) -> bool {
        let mut timers = self.core.timers.lock();
        let before = timers.len();
        timers.retain(|t| t.handle != handle);
        before != timers.len()
    }

    /// Cancel every timer, leaving the scheduler running.
    pub fn cancel_all(&self) -> usize {
        let mut timers = self.core.timers.lock();
        let count = timers.len();
        timers.clear();
        count
    }

    pub fn timer_count(&self) -> usize {
        self.core.timers.lock().len()
    }

    /// Host cycle hook: due synchronous timers, then queued mutation jobs.
    /// Returns the number of jobs drained.
    pub fn on_cycle(&self, host: &mut dyn WorldHost) -> usize {
        self.core.poll_sync(host);
        self.core
            .executor
            .queue()
            .drain(host, self.core.batch_limit)
    }

    /// Fire due asynchronous timers now. The timer thread calls this.
    pub fn poll_async(&self) -> usize {
        self.core.poll_async()
    }

    /// Start the timer thread. Calling it twice is harmless.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.core.stopped.store(false, Ordering::Release);
        self.core.executor.queue().reopen();

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let ticker = crossbeam_channel::tick(self.resolution);
        let core = Arc::clone(&self.core);
        let handle = std::thread::Builder::new()
            .name("ballast-timer".into())
            .spawn(move || {
                loop {
                    crossbeam_channel::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            core.poll_async();
                        }
                    }
                }
                tracing::debug!("timer thread exited");
            })?;
        *slot = Some((stop_tx, handle));
        tracing::info!(resolution = ?self.resolution, "scheduler started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Cancel every timer, close the mutation queue and join the timer
    /// thread.
    pub fn stop(&self) {
        self.core.stopped.store(true, Ordering::Release);
        let cancelled = self.cancel_all();
        let dropped = self.core.executor.queue().close();
        if let Some((stop_tx, handle)) = self.thread.lock().take() {
            let _ = stop_tx.send(());
            if handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
            tracing::info!(cancelled, dropped, "scheduler stopped");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_common::ManualClock;
    use ballast_sim::SimWorld;
    use std::sync::atomic::AtomicUsize;

    fn scheduler(clock: Arc<ManualClock>) -> Scheduler {
        Scheduler::new(&SchedulerConfig::default(), clock).unwrap()
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn sync_timer_runs_when_due() {
        let clock = Arc::new(ManualClock::new(0));
        let sched = scheduler(Arc::clone(&clock));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        sched.every_sync("probe", 100, 100, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut world = SimWorld::new();
        sched.on_cycle(&mut world);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        clock.set(100);
        sched.on_cycle(&mut world);
        sched.on_cycle(&mut world);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Missed periods collapse into a single run.
        clock.set(1_000);
        sched.on_cycle(&mut world);
        sched.on_cycle(&mut world);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancelled_timer_never_runs() {
        let clock = Arc::new(ManualClock::new(0));
        let sched = scheduler(Arc::clone(&clock));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = sched.every_sync("probe", 0, 10, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sched.cancel(handle));
        assert!(!sched.cancel(handle));
        sched.on_cycle(&mut SimWorld::new());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn async_timer_runs_on_the_pool() {
        let clock = Arc::new(ManualClock::new(0));
        let sched = scheduler(Arc::clone(&clock));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        sched.every_async("probe", 0, 1_000, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(sched.poll_async(), 1);
        assert!(wait_for(|| runs.load(Ordering::SeqCst) == 1));
        // Not due again until the period elapses.
        assert_eq!(sched.poll_async(), 0);
        clock.set(1_000);
        assert!(wait_for(|| {
            sched.poll_async();
            runs.load(Ordering::SeqCst) == 2
        }));
    }

    #[test]
    fn overlapping_async_runs_are_skipped() {
        let clock = Arc::new(ManualClock::new(0));
        let sched = scheduler(Arc::clone(&clock));
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        sched.every_async("slow", 0, 10, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.recv_timeout(Duration::from_secs(2));
        });

        assert_eq!(sched.poll_async(), 1);
        assert!(wait_for(|| runs.load(Ordering::SeqCst) == 1));
        clock.set(50);
        assert_eq!(sched.poll_async(), 0);
        release_tx.send(()).unwrap();
    }

    #[test]
    fn stop_cancels_timers_and_closes_queue() {
        let clock = Arc::new(ManualClock::new(0));
        let sched = scheduler(clock);
        sched.start().unwrap();
        assert!(sched.is_running());
        sched.every_sync("a", 0, 10, |_| {});
        sched.every_async("b", 0, 10, || {});
        assert_eq!(sched.timer_count(), 2);

        sched.stop();
        assert!(!sched.is_running());
        assert_eq!(sched.timer_count(), 0);
        assert!(
            sched
                .executor()
                .submit(Box::new(|_: &mut dyn WorldHost| {}))
                .is_err()
        );
    }

    #[test]
    fn timer_thread_fires_async_tasks() {
        let clock: Arc<dyn Clock> = Arc::new(ballast_common::MonotonicClock::new());
        let config = SchedulerConfig {
            resolution_ms: 5,
            ..SchedulerConfig::default()
        };
        let sched = Scheduler::new(&config, clock).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        sched.every_async("tick", 0, 10, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sched.start().unwrap();
        assert!(wait_for(|| runs.load(Ordering::SeqCst) >= 2));
        sched.stop();
    }
}
