//! Per-bucket rate-limit state.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::classifier::RateLimitHeaders;

/// Mutable accounting for one bucket.
#[derive(Debug, Clone, Default)]
pub struct BucketState {
    /// Unknown until the first response reports it.
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    pub reset_at: Option<Instant>,
    /// Bucket-local block from a 429. Global blocks are tracked separately.
    pub blocked_until: Option<Instant>,
    /// Remote bucket identity once learned.
    pub bucket_id: Option<String>,
}

/// Ticket bookkeeping for a bucket's pending queue.
#[derive(Debug, Default)]
struct TurnQueue {
    next_ticket: u64,
    /// Tickets dropped before their turn came; skipped when serving advances.
    abandoned: BTreeSet<u64>,
}

/// One rate-limit bucket.
///
/// Requests take a numbered ticket when they are reserved and run strictly
/// in ticket order, so whoever holds the current turn is the single writer
/// of `remaining`/`reset_at` and the only request in flight for the bucket.
#[derive(Debug)]
pub struct Bucket {
    key: String,
    turns: Mutex<TurnQueue>,
    /// Ticket currently allowed to run.
    serving: watch::Sender<u64>,
    state: Mutex<BucketState>,
    pending: AtomicUsize,
}

/// A reserved place in a bucket's queue.
///
/// Taken synchronously, so reservation order is fixed before any task is
/// spawned. Dropping it before its turn gives the place up.
#[derive(Debug)]
pub struct BucketTicket {
    bucket: Arc<Bucket>,
    number: u64,
    waiting: bool,
}

impl BucketTicket {
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    /// Wait until every earlier ticket has been served.
    pub async fn wait(mut self) -> BucketTurn {
        let mut serving = self.bucket.serving.subscribe();
        // The sender lives in the bucket this ticket keeps alive.
        let _ = serving.wait_for(|current| *current == self.number).await;
        self.waiting = false;
        BucketTurn {
            bucket: self.bucket.clone(),
        }
    }
}

impl Drop for BucketTicket {
    fn drop(&mut self) {
        if self.waiting {
            self.bucket.abandon(self.number);
        }
    }
}

/// Exclusive execution slot in a bucket. Dropping it lets the next request run.
#[derive(Debug)]
pub struct BucketTurn {
    bucket: Arc<Bucket>,
}

impl Drop for BucketTurn {
    fn drop(&mut self) {
        self.bucket.finish_turn();
    }
}

impl Bucket {
    pub fn new(key: &str) -> Self {
        let (serving, _) = watch::channel(0);
        Self {
            key: key.to_string(),
            turns: Mutex::new(TurnQueue::default()),
            serving,
            state: Mutex::new(BucketState::default()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Key this bucket was first created under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Take the next place in this bucket's queue.
    pub fn reserve_turn(self: &Arc<Self>) -> BucketTicket {
        let number = {
            let mut turns = self.turns();
            let number = turns.next_ticket;
            turns.next_ticket += 1;
            number
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        BucketTicket {
            bucket: self.clone(),
            number,
            waiting: true,
        }
    }

    /// Reserve a place and wait for it.
    pub async fn acquire_turn(self: &Arc<Self>) -> BucketTurn {
        self.reserve_turn().wait().await
    }

    /// Requests waiting for or holding this bucket's turn.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    fn finish_turn(&self) {
        let mut turns = self.turns();
        self.advance(&mut turns);
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    fn abandon(&self, number: u64) {
        let mut turns = self.turns();
        if *self.serving.borrow() == number {
            self.advance(&mut turns);
        } else {
            turns.abandoned.insert(number);
        }
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    /// Move to the next live ticket. Callers hold the `turns` lock.
    fn advance(&self, turns: &mut TurnQueue) {
        let mut next = *self.serving.borrow() + 1;
        while turns.abandoned.remove(&next) {
            next += 1;
        }
        self.serving.send_replace(next);
    }

    fn turns(&self) -> MutexGuard<'_, TurnQueue> {
        self.turns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> BucketState {
        self.lock().clone()
    }

    pub fn blocked_until(&self) -> Option<Instant> {
        self.lock().blocked_until.filter(|until| *until > Instant::now())
    }

    /// Block this bucket until `until`, replacing any previous bucket block.
    pub fn block_until(&self, until: Instant) {
        self.lock().blocked_until = Some(until);
    }

    /// Deadline to wait for before the next request may go out, if the
    /// bucket is exhausted. Refills the bucket once its reset has passed.
    pub fn exhausted_until(&self) -> Option<Instant> {
        let mut state = self.lock();
        let now = Instant::now();
        match (state.remaining, state.reset_at) {
            (Some(0), Some(reset)) if reset > now => Some(reset),
            (_, Some(reset)) if reset <= now => {
                state.remaining = state.limit;
                state.reset_at = None;
                None
            }
            _ => None,
        }
    }

    /// Optimistically spend one request before sending it.
    pub fn consume(&self) {
        let mut state = self.lock();
        if let Some(remaining) = state.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }

    /// Apply authoritative state from response headers.
    ///
    /// Returns the remote bucket id when it was learned for the first time
    /// or changed.
    pub fn apply_headers(&self, headers: &RateLimitHeaders) -> Option<String> {
        let mut state = self.lock();
        if let Some(limit) = headers.limit {
            state.limit = Some(limit);
        }
        if let Some(remaining) = headers.remaining {
            state.remaining = Some(remaining);
        }
        if let Some(reset_after) = headers.reset_after {
            state.reset_at = Some(Instant::now() + reset_after);
        }
        match &headers.bucket {
            Some(id) if state.bucket_id.as_deref() != Some(id.as_str()) => {
                state.bucket_id = Some(id.clone());
                Some(id.clone())
            }
            _ => None,
        }
    }

    /// Time until the bucket refills, if known.
    pub fn reset_in(&self) -> Option<Duration> {
        self.lock()
            .reset_at
            .map(|reset| reset.saturating_duration_since(Instant::now()))
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(remaining: u32, limit: u32, reset_after_ms: u64) -> RateLimitHeaders {
        RateLimitHeaders {
            remaining: Some(remaining),
            limit: Some(limit),
            reset_after: Some(Duration::from_millis(reset_after_ms)),
            bucket: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_state_is_not_exhausted() {
        let bucket = Bucket::new("GET /users/@me");
        bucket.consume();
        assert_eq!(bucket.snapshot().remaining, None);
        assert_eq!(bucket.exhausted_until(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_until_reset_then_refills() {
        let bucket = Bucket::new("k");
        bucket.apply_headers(&headers(1, 4, 1000));
        bucket.consume();
        assert_eq!(bucket.snapshot().remaining, Some(0));

        let until = bucket.exhausted_until().expect("bucket should be exhausted");
        assert_eq!(until.duration_since(Instant::now()), Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(bucket.exhausted_until(), None);
        assert_eq!(bucket.snapshot().remaining, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_saturates_at_zero() {
        let bucket = Bucket::new("k");
        bucket.apply_headers(&headers(0, 4, 1000));
        bucket.consume();
        assert_eq!(bucket.snapshot().remaining, Some(0));
    }

    #[tokio::test]
    async fn test_bucket_id_reported_once() {
        let bucket = Bucket::new("k");
        let mut h = headers(3, 4, 1000);
        h.bucket = Some("abcd".to_string());
        assert_eq!(bucket.apply_headers(&h), Some("abcd".to_string()));
        assert_eq!(bucket.apply_headers(&h), None);
    }

    #[tokio::test]
    async fn test_turns_are_granted_in_order() {
        let bucket = Arc::new(Bucket::new("k"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = bucket.acquire_turn().await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let bucket = bucket.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _turn = bucket.acquire_turn().await;
                order.lock().unwrap().push(i);
            }));
            // Let each task enqueue before spawning the next.
            tokio::task::yield_now().await;
        }
        assert_eq!(bucket.pending(), 6);
        drop(first);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(bucket.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reservation_order_beats_wait_order() {
        let bucket = Arc::new(Bucket::new("k"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let tickets: Vec<_> = (0..32).map(|_| bucket.reserve_turn()).collect();

        // Start waiting in reverse; turns still follow reservation order.
        let mut handles = Vec::new();
        for (i, ticket) in tickets.into_iter().enumerate().rev() {
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _turn = ticket.wait().await;
                order.lock().unwrap().push(i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..32).collect::<Vec<_>>());
        assert_eq!(bucket.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gives_up_its_place() {
        let bucket = Arc::new(Bucket::new("k"));
        let first = bucket.acquire_turn().await;

        let cancelled = {
            let bucket = bucket.clone();
            tokio::spawn(async move {
                let _turn = bucket.acquire_turn().await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(bucket.pending(), 2);

        cancelled.abort();
        assert!(cancelled.await.unwrap_err().is_cancelled());
        assert_eq!(bucket.pending(), 1);

        let next = bucket.reserve_turn();
        drop(first);
        let _turn = tokio::time::timeout(Duration::from_secs(1), next.wait())
            .await
            .expect("abandoned place must be skipped");
        assert_eq!(bucket.pending(), 1);
    }

    #[tokio::test]
    async fn test_unused_ticket_releases_current_turn() {
        let bucket = Arc::new(Bucket::new("k"));
        let unused = bucket.reserve_turn();
        let next = bucket.reserve_turn();
        assert_eq!(bucket.pending(), 2);

        drop(unused);
        let turn = tokio::time::timeout(Duration::from_secs(1), next.wait())
            .await
            .expect("dropped ticket must pass its turn on");
        drop(turn);
        assert_eq!(bucket.pending(), 0);
    }
}
