//! Global throughput limiter applied to job pulls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::sleep;

/// Admits at most `max_per_window` pulls per rolling `window`.
///
/// Each pull holds a permit for the full window, then releases it.
#[derive(Debug, Clone)]
pub struct ThroughputLimiter {
    semaphore: Arc<Semaphore>,
    window: Duration,
}

impl ThroughputLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_per_window.max(1) as usize)),
            window,
        }
    }

    pub fn per_second(max: u32) -> Self {
        Self::new(max, Duration::from_secs(1))
    }

    /// Wait for a slot in the current window.
    pub async fn acquire(&self) {
        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            // The semaphore is never closed.
            return;
        };
        let window = self.window;
        tokio::spawn(async move {
            sleep(window).await;
            drop(permit);
        });
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
