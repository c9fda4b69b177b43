//! Rolling invalid-request accounting.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Result of recording one invalid response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTally {
    /// Invalid responses inside the window, including this one.
    pub count: usize,
    /// True only for the response that crossed the threshold.
    pub crossed: bool,
}

/// Counts 401/403/429 responses over a trailing window.
///
/// Crossing the threshold is reported once. The trigger re-arms only after
/// enough entries age out for the count to drop back below the threshold.
#[derive(Debug)]
pub struct InvalidRequestCounter {
    window: Duration,
    threshold: usize,
    hits: VecDeque<Instant>,
    tripped: bool,
}

impl InvalidRequestCounter {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            window,
            threshold: threshold as usize,
            hits: VecDeque::new(),
            tripped: false,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() < self.threshold {
            self.tripped = false;
        }
    }

    /// Record an invalid response at `now`.
    pub fn record(&mut self, now: Instant) -> InvalidTally {
        self.prune(now);
        self.hits.push_back(now);

        let count = self.hits.len();
        let crossed = !self.tripped && count >= self.threshold;
        if crossed {
            self.tripped = true;
        }
        InvalidTally { count, crossed }
    }

    /// Invalid responses currently inside the window.
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.hits.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}
