use std::time::Duration;

/// Fixed-capacity ring of cycle durations.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    history: Vec<Duration>,
    capacity: usize,
    index: usize,
    filled: bool,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: vec![Duration::ZERO; capacity],
            capacity,
            index: 0,
            filled: false,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.history[self.index] = sample;
        self.index = (self.index + 1) % self.capacity;
        if self.index == 0 {
            self.filled = true;
        }
    }

    pub fn count(&self) -> usize {
        if self.filled {
            self.capacity
        } else {
            self.index
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn average(&self) -> Option<Duration> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let total: Duration = self.history[..count].iter().sum();
        Some(total / count as u32)
    }

    pub fn max(&self) -> Option<Duration> {
        self.history[..self.count()].iter().copied().max()
    }

    /// Up to `n` samples, newest first.
    pub fn newest(&self, n: usize) -> impl Iterator<Item = Duration> + '_ {
        let take = n.min(self.count());
        (0..take).map(move |i| {
            let slot = (self.index + self.capacity - 1 - i) % self.capacity;
            self.history[slot]
        })
    }

    pub fn clear(&mut self) {
        self.index = 0;
        self.filled = false;
    }
}
