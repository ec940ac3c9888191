use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

pub type ScaleCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Opaque ticket returned by [`SubscriberRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberHandle(u64);

#[derive(Clone)]
pub struct Subscriber {
    pub owner: String,
    pub callback: ScaleCallback,
}

/// Scale subscribers, invoked in registration order.
#[derive(Default)]
pub struct SubscriberRegistry {
    next: AtomicU64,
    subscribers: RwLock<BTreeMap<SubscriberHandle, Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        owner: impl Into<String>,
        callback: impl Fn(f64) + Send + Sync + 'static,
    ) -> SubscriberHandle {
        let handle = SubscriberHandle(self.next.fetch_add(1, Ordering::Relaxed));
        let owner = owner.into();
        tracing::debug!(?handle, %owner, "scale subscriber registered");
        self.subscribers.write().insert(
            handle,
            Subscriber {
                owner,
                callback: Arc::new(callback),
            },
        );
        handle
    }

    pub fn unregister(&self, handle: SubscriberHandle) -> bool {
        let removed = self.subscribers.write().remove(&handle);
        if let Some(sub) = &removed {
            tracing::debug!(?handle, owner = %sub.owner, "scale subscriber removed");
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    pub fn owners(&self) -> Vec<String> {
        self.subscribers
            .read()
            .values()
            .map(|s| s.owner.clone())
            .collect()
    }

    /// Copy of the current subscribers, so callbacks run without the lock.
    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers.read().values().cloned().collect()
    }

    /// Invoke every subscriber directly on the calling thread.
    pub fn notify(&self, scale: f64) -> usize {
        notify_all(&self.snapshot(), scale)
    }

    pub fn clear(&self) {
        self.subscribers.write().clear();
    }
}

/// Call each subscriber in isolation. A panicking callback is logged and the
/// rest still run. Returns how many completed.
pub fn notify_all(subscribers: &[Subscriber], scale: f64) -> usize {
    let mut delivered = 0;
    for sub in subscribers {
        match catch_unwind(AssertUnwindSafe(|| (sub.callback)(scale))) {
            Ok(()) => delivered += 1,
            Err(_) => tracing::error!(owner = %sub.owner, scale, "scale subscriber panicked"),
        }
    }
    delivered
}
