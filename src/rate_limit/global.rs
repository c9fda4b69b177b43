//! Process-wide block shared by every bucket.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// The single global block.
///
/// Latest block wins: setting a new block replaces the previous deadline,
/// whether it is longer or shorter.
#[derive(Debug, Default)]
pub struct GlobalBlock {
    blocked_until: Mutex<Option<Instant>>,
}

impl GlobalBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `now + duration`, replacing any previous block.
    pub fn block_for(&self, duration: Duration) -> Instant {
        let until = Instant::now() + duration;
        *self.lock() = Some(until);
        until
    }

    /// Deadline of the current block, if it is still in the future.
    pub fn blocked_until(&self) -> Option<Instant> {
        let mut guard = self.lock();
        match *guard {
            Some(until) if until > Instant::now() => Some(until),
            Some(_) => {
                *guard = None;
                None
            }
            None => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_until().is_some()
    }

    /// Time left on the current block.
    pub fn remaining(&self) -> Option<Duration> {
        self.blocked_until()
            .map(|until| until.saturating_duration_since(Instant::now()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        // A poisoned lock still holds a valid deadline.
        self.blocked_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
