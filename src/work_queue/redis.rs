//! Redis-list job queue for multi-process producers.
//!
//! Producers `RPUSH` jobs onto `<queue>:waiting`; the single consumer pops
//! them with `BLPOP`. Pause state is a key so every process sees it, and
//! outcomes of watched jobs are pushed onto a per-job result list that
//! expires if nobody collects it. A watcher gives up after its result
//! timeout and reports the job as cancelled.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    Completion, Job, JobHandle, JobOutcome, JobQueue, Pulled, QueueError, ThroughputLimiter,
};
use crate::error::{JobFailure, JobFailureKind};

/// Seconds an uncollected result is kept.
const RESULT_TTL_SECS: i64 = 3600;
/// Result wait used until [`RedisJobQueue::with_result_timeout`] sets one.
const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(3600);
/// Longest single BLPOP before pause state and the pull deadline are re-checked.
const POP_TIMEOUT_SECS: f64 = 1.0;
/// BLPOP treats 0 as "forever".
const MIN_POP_TIMEOUT_SECS: f64 = 0.1;
/// Poll interval while the queue is paused.
const PAUSE_POLL: Duration = Duration::from_millis(250);

/// Redis-backed job queue.
pub struct RedisJobQueue {
    name: String,
    client: redis::Client,
    conn: ConnectionManager,
    /// Dedicated connection for blocking pops, created on first pull.
    pop_conn: Mutex<Option<MultiplexedConnection>>,
    limiter: Option<ThroughputLimiter>,
    result_timeout: Duration,
}

impl RedisJobQueue {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `name` - Queue name shared by producers and the consumer
    pub async fn connect(redis_url: &str, name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            name: name.to_string(),
            client,
            conn,
            pop_conn: Mutex::new(None),
            limiter: None,
            result_timeout: DEFAULT_RESULT_TIMEOUT,
        })
    }

    /// Hand out at most `max_per_second` jobs per second from this process.
    pub fn with_rate_limit(mut self, max_per_second: u32) -> Self {
        self.limiter = Some(ThroughputLimiter::per_second(max_per_second));
        self
    }

    /// How long a watching producer waits for a result before the job is
    /// reported as cancelled.
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    fn waiting_key(&self) -> String {
        format!("{}:waiting", self.name)
    }

    fn paused_key(&self) -> String {
        format!("{}:paused", self.name)
    }

    fn result_key(&self, job: &Job) -> String {
        format!("{}:result:{}", self.name, job.id)
    }

    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.waiting_key(), payload).await?;
        Ok(())
    }

    async fn pop(&self, timeout_secs: f64) -> Result<Option<Job>, QueueError> {
        let mut guard = self.pop_conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };

        let popped: Option<(String, String)> =
            conn.blpop(self.waiting_key(), timeout_secs).await?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, job: Job) -> Result<(), QueueError> {
        self.push(&job).await
    }

    async fn submit_and_watch(&self, mut job: Job) -> Result<Completion, QueueError> {
        job.options.notify_completion = true;
        let result_key = self.result_key(&job);
        // Separate connection: BLPOP would stall the shared one.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.push(&job).await?;

        let (tx, rx) = oneshot::channel();
        let wait = self.result_timeout;
        let route = job.request.route.clone();
        tokio::spawn(async move {
            let popped: Result<Option<(String, String)>, _> =
                conn.blpop(&result_key, result_wait_secs(wait)).await;
            let outcome = match popped {
                Ok(Some((_, payload))) => match serde_json::from_str::<JobOutcome>(&payload) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Malformed result on {}: {}", result_key, e);
                        return;
                    }
                },
                Ok(None) => {
                    warn!("No result on {} within {:?}", result_key, wait);
                    unanswered(&route, wait)
                }
                Err(e) => {
                    warn!("Failed waiting for {}: {}", result_key, e);
                    return;
                }
            };
            // The producer may have stopped waiting.
            let _ = tx.send(outcome);
        });
        Ok(rx)
    }

    async fn next(&self, wait: Duration) -> Result<Pulled, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(Pulled::Idle);
            }
            if self.is_paused().await? {
                tokio::time::sleep(PAUSE_POLL.min(left)).await;
                continue;
            }
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            let timeout_secs = left
                .as_secs_f64()
                .clamp(MIN_POP_TIMEOUT_SECS, POP_TIMEOUT_SECS);
            if let Some(job) = self.pop(timeout_secs).await? {
                debug!("Pulled job {} from {}", job.id, self.name);
                return Ok(Pulled::Job(JobHandle::new(job)));
            }
        }
    }

    async fn complete(&self, handle: JobHandle, outcome: JobOutcome) -> Result<(), QueueError> {
        let job = handle.into_job();
        if !job.options.notify_completion {
            return Ok(());
        }
        let key = self.result_key(&job);
        let payload = serde_json::to_string(&outcome)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .rpush(&key, payload)
            .expire(&key, RESULT_TTL_SECS)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.paused_key(), "1").await?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.paused_key()).await?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.paused_key()).await?)
    }
}

/// BLPOP timeout for a result wait. Never 0, which would block forever.
fn result_wait_secs(wait: Duration) -> f64 {
    wait.as_secs_f64().max(MIN_POP_TIMEOUT_SECS)
}

/// Outcome reported when no consumer answered within the result timeout.
fn unanswered(route: &str, waited: Duration) -> JobOutcome {
    JobOutcome::Failed(JobFailure {
        kind: JobFailureKind::Cancelled,
        message: format!("No result within {:?}", waited),
        route: Some(route.to_string()),
        attempts: 0,
    })
}
