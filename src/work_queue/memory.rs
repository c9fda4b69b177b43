//! In-process job queue for single-process operation.
//!
//! Fast, lock-based queue. Jobs are not persisted across restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Notify};
use uuid::Uuid;

use super::{
    Completion, Job, JobHandle, JobOutcome, JobQueue, Pulled, QueueError, ThroughputLimiter,
};

/// In-memory FIFO job queue.
pub struct InMemoryJobQueue {
    name: String,
    jobs: Mutex<VecDeque<Job>>,
    watchers: Mutex<HashMap<Uuid, oneshot::Sender<JobOutcome>>>,
    available: Notify,
    paused: watch::Sender<bool>,
    closed: AtomicBool,
    limiter: Option<ThroughputLimiter>,
}

impl InMemoryJobQueue {
    /// Create an unthrottled queue.
    pub fn new(name: &str) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            jobs: Mutex::new(VecDeque::new()),
            watchers: Mutex::new(HashMap::new()),
            available: Notify::new(),
            paused,
            closed: AtomicBool::new(false),
            limiter: None,
        }
    }

    /// Create a queue that hands out at most `max_per_second` jobs per second.
    pub fn with_rate_limit(name: &str, max_per_second: u32) -> Self {
        Self {
            limiter: Some(ThroughputLimiter::per_second(max_per_second)),
            ..Self::new(name)
        }
    }

    /// Jobs waiting to be pulled.
    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new jobs. Jobs already queued are still handed out, after
    /// which `next` returns [`Pulled::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push(&self, job: Job) {
        self.jobs().push_back(job);
        self.available.notify_one();
    }

    /// Wait for a job without a deadline. Only the final pop takes a job,
    /// after the last await, so dropping this future loses nothing.
    async fn pull(&self) -> Pulled {
        loop {
            let notified = self.available.notified();
            if self.jobs().is_empty() {
                if self.is_closed() {
                    return Pulled::Closed;
                }
                notified.await;
                continue;
            }

            if *self.paused.borrow() {
                self.wait_until_resumed().await;
                continue;
            }

            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
                if *self.paused.borrow() {
                    continue;
                }
            }

            if let Some(job) = self.jobs().pop_front() {
                return Pulled::Job(JobHandle::new(job));
            }
        }
    }

    async fn wait_until_resumed(&self) {
        let mut rx = self.paused.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<JobOutcome>>> {
        self.watchers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, job: Job) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.push(job);
        Ok(())
    }

    async fn submit_and_watch(&self, mut job: Job) -> Result<Completion, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        job.options.notify_completion = true;
        self.watchers().insert(job.id, tx);
        self.push(job);
        Ok(rx)
    }

    async fn next(&self, wait: Duration) -> Result<Pulled, QueueError> {
        Ok(tokio::time::timeout(wait, self.pull())
            .await
            .unwrap_or(Pulled::Idle))
    }

    async fn complete(&self, handle: JobHandle, outcome: JobOutcome) -> Result<(), QueueError> {
        let job = handle.into_job();
        if let Some(tx) = self.watchers().remove(&job.id) {
            // The producer may have stopped waiting.
            let _ = tx.send(outcome);
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.paused.send_replace(true);
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.paused.send_replace(false);
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        Ok(*self.paused.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{JobFailure, JobFailureKind};
    use crate::request::{ApiRequest, ApiResponse, RequestOptions};

    const WAIT: Duration = Duration::from_secs(60);

    fn job(route: &str) -> Job {
        Job::new("test", ApiRequest::new(route, RequestOptions::get(), None))
    }

    async fn pull(queue: &InMemoryJobQueue) -> JobHandle {
        match queue.next(WAIT).await.unwrap() {
            Pulled::Job(handle) => handle,
            other => panic!("expected a job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryJobQueue::new("test");
        queue.submit(job("/a")).await.unwrap();
        queue.submit(job("/b")).await.unwrap();

        let first = pull(&queue).await;
        let second = pull(&queue).await;
        assert_eq!(first.job().request.route, "/a");
        assert_eq!(second.job().request.route, "/b");

        queue
            .complete(first, JobOutcome::Completed(ApiResponse::from_parts(204, Default::default(), b"")))
            .await
            .unwrap();
        queue
            .complete(second, JobOutcome::Completed(ApiResponse::from_parts(204, Default::default(), b"")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_receives_outcome() {
        let queue = InMemoryJobQueue::new("test");
        let completion = queue.submit_and_watch(job("/a")).await.unwrap();

        let handle = pull(&queue).await;
        assert!(handle.job().options.notify_completion);
        assert_eq!(handle.job().options.attempts, 1);

        let failure = JobFailure {
            kind: JobFailureKind::Timeout,
            message: "timed out".to_string(),
            route: Some("/a".to_string()),
            attempts: 4,
        };
        queue
            .complete(handle, JobOutcome::Failed(failure.clone()))
            .await
            .unwrap();

        assert_eq!(completion.await.unwrap(), JobOutcome::Failed(failure));
        assert!(queue.watchers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_queue_withholds_jobs() {
        let queue = std::sync::Arc::new(InMemoryJobQueue::new("test"));
        queue.submit(job("/a")).await.unwrap();
        queue.pause().await.unwrap();
        assert!(queue.is_paused().await.unwrap());

        let pulled = queue.next(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(pulled, Pulled::Idle), "paused queue must not hand out jobs");
        assert_eq!(queue.len(), 1);

        queue.resume().await.unwrap();
        let handle = pull(&queue).await;
        queue
            .complete(handle, JobOutcome::Completed(ApiResponse::from_parts(200, Default::default(), b"")))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_waits_for_submission() {
        let queue = std::sync::Arc::new(InMemoryJobQueue::new("test"));
        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move { pull(&queue).await.into_job() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.submit(job("/late")).await.unwrap();
        assert_eq!(puller.await.unwrap().request.route, "/late");
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let queue = std::sync::Arc::new(InMemoryJobQueue::new("test"));
        queue.submit(job("/a")).await.unwrap();

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let first = pull(&queue).await.into_job();
                let second = queue.next(WAIT).await.unwrap();
                (first, matches!(second, Pulled::Closed))
            })
        };
        tokio::task::yield_now().await;
        queue.close();

        assert!(matches!(
            queue.submit(job("/b")).await,
            Err(QueueError::Closed)
        ));
        let (first, ended) = waiting.await.unwrap();
        assert_eq!(first.request.route, "/a");
        assert!(ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_pulls() {
        let queue = InMemoryJobQueue::with_rate_limit("test", 2);
        for i in 0..3 {
            queue.submit(job(&format!("/{i}"))).await.unwrap();
        }
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            pull(&queue).await.into_job();
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_pull_keeps_later_job() {
        let queue = InMemoryJobQueue::new("test");
        assert!(matches!(
            queue.next(Duration::from_millis(100)).await.unwrap(),
            Pulled::Idle
        ));

        queue.submit(job("/after")).await.unwrap();
        assert_eq!(pull(&queue).await.into_job().request.route, "/after");
        assert!(queue.is_empty());
    }
}
