//! Job queue seam between producers and the single consumer.
//!
//! The queue transport is an external collaborator: this module defines the
//! envelope ([`Job`]), the interface ([`JobQueue`]) and thin adapters for an
//! in-process queue and (with the `redis-backend` feature) Redis lists.

mod error;
mod handle;
mod memory;
mod throughput;

#[cfg(feature = "redis-backend")]
mod redis;

pub use error::QueueError;
pub use handle::JobHandle;
pub use memory::InMemoryJobQueue;
pub use throughput::ThroughputLimiter;

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisJobQueue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::JobFailure;
use crate::request::{ApiRequest, ApiResponse};

/// Delivery options attached to every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Always 1: retries belong to the bucket manager, not the queue.
    pub attempts: u32,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    /// Whether a producer is waiting for the outcome.
    #[serde(default)]
    pub notify_completion: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            remove_on_complete: true,
            remove_on_fail: true,
            notify_completion: false,
        }
    }
}

/// Queue envelope for one API request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub request: ApiRequest,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(queue: &str, request: ApiRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            request,
            options: JobOptions::default(),
            created_at: Utc::now(),
        }
    }
}

/// Final result of a job, delivered to a waiting producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(ApiResponse),
    Failed(JobFailure),
}

/// Result of one bounded pull.
#[derive(Debug)]
pub enum Pulled {
    Job(JobHandle),
    /// Nothing was handed out within the wait, e.g. empty or paused.
    Idle,
    /// The queue can never deliver another job.
    Closed,
}

/// Resolves once the consumer completes the watched job.
pub type Completion = oneshot::Receiver<JobOutcome>;

/// FIFO job queue with pause/resume, throughput limiting and completion
/// notification.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a job nobody waits on.
    async fn submit(&self, job: Job) -> Result<(), QueueError>;

    /// Submit a job and get notified of its outcome.
    async fn submit_and_watch(&self, job: Job) -> Result<Completion, QueueError>;

    /// Wait up to about `wait` for the next job.
    ///
    /// Honors pause and the throughput limiter. Callers must let the future
    /// finish: a job taken off a remote queue is only owned by the returned
    /// handle.
    async fn next(&self, wait: Duration) -> Result<Pulled, QueueError>;

    /// Record the outcome of a pulled job and discard it.
    async fn complete(&self, handle: JobHandle, outcome: JobOutcome) -> Result<(), QueueError>;

    /// Stop handing out jobs. Jobs already pulled are unaffected.
    async fn pause(&self) -> Result<(), QueueError>;

    async fn resume(&self) -> Result<(), QueueError>;

    async fn is_paused(&self) -> Result<bool, QueueError>;
}

/// Type alias for a shared queue.
pub type BoxedJobQueue = Arc<dyn JobQueue>;
