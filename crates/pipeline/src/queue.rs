use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ballast_common::{DispatchError, SyncDispatch, SyncJob, WorldHost};
use crossbeam_channel::{Receiver, Sender};

/// Work waiting for the mutation context.
///
/// Any thread may submit; only the host's cycle drains. Clones share one
/// channel.
#[derive(Clone)]
pub struct MutationQueue {
    tx: Sender<SyncJob>,
    rx: Receiver<SyncJob>,
    closed: Arc<AtomicBool>,
}

impl MutationQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn submit(&self, job: SyncJob) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::Closed);
        }
        self.tx.send(job).map_err(|_| DispatchError::Closed)
    }

    /// Run up to `limit` queued jobs on the calling (mutation) thread.
    pub fn drain(&self, host: &mut dyn WorldHost, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit {
            let Ok(job) = self.rx.try_recv() else {
                break;
            };
            if catch_unwind(AssertUnwindSafe(|| job(&mut *host))).is_err() {
                tracing::error!("mutation job panicked");
            }
            ran += 1;
        }
        ran
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Refuse further submissions and drop what is queued. Returns the
    /// number of dropped jobs.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncDispatch for MutationQueue {
    fn dispatch(&self, job: SyncJob) -> Result<(), DispatchError> {
        self.submit(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_sim::SimWorld;

    #[test]
    fn drains_in_submission_order_up_to_limit() {
        let queue = MutationQueue::new();
        for i in 0..5 {
            queue
                .submit(Box::new(move |host: &mut dyn WorldHost| {
                    host.broadcast(&format!("job {i}"));
                }))
                .unwrap();
        }
        let mut world = SimWorld::new();
        assert_eq!(queue.drain(&mut world, 3), 3);
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.drain(&mut world, 10), 2);
        assert_eq!(world.broadcasts(), vec!["job 0", "job 1", "job 2", "job 3", "job 4"]);
    }

    #[test]
    fn closed_queue_rejects_and_drops() {
        let queue = MutationQueue::new();
        queue.submit(Box::new(|_: &mut dyn WorldHost| {})).unwrap();
        assert_eq!(queue.close(), 1);
        assert_eq!(
            queue.submit(Box::new(|_: &mut dyn WorldHost| {})),
            Err(DispatchError::Closed)
        );
        queue.reopen();
        assert!(queue.submit(Box::new(|_: &mut dyn WorldHost| {})).is_ok());
    }

    #[test]
    fn panicking_job_does_not_stop_the_drain() {
        let queue = MutationQueue::new();
        queue
            .submit(Box::new(|_: &mut dyn WorldHost| panic!("bad job")))
            .unwrap();
        queue
            .submit(Box::new(|host: &mut dyn WorldHost| host.broadcast("after")))
            .unwrap();
        let mut world = SimWorld::new();
        assert_eq!(queue.drain(&mut world, 10), 2);
        assert_eq!(world.broadcasts(), vec!["after"]);
    }
}
