//! The single consumer: pulls jobs and runs them through the bucket manager.
//!
//! Exactly one consumer may run per remote API credential. Bucket state and
//! the global block live in this process only, so a second consumer would
//! spend from the same remote budget without seeing it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::error::JobFailure;
use crate::rate_limit::{BucketManager, BucketTicket};
use crate::work_queue::{BoxedJobQueue, JobHandle, JobOutcome, Pulled};

/// Backoff after the queue itself fails to hand out a job.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Longest a single pull blocks before shutdown is checked again.
const PULL_WAIT: Duration = Duration::from_secs(1);

/// Whether the consumer is currently pulling jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Running,
    Paused { until: Instant },
}

struct PauseTimer {
    generation: u64,
    until: Instant,
    task: JoinHandle<()>,
}

/// Pauses the queue for a duration. A new pause replaces the pending timer
/// instead of stacking on it, so the queue resumes when the latest one ends.
struct QueuePauser {
    queue: BoxedJobQueue,
    timer: Mutex<Option<PauseTimer>>,
}

impl QueuePauser {
    fn new(queue: BoxedJobQueue) -> Arc<Self> {
        Arc::new(Self {
            queue,
            timer: Mutex::new(None),
        })
    }

    async fn pause_for(self: &Arc<Self>, duration: Duration) {
        let mut timer = self.timer.lock().await;
        let generation = match timer.take() {
            Some(previous) => {
                previous.task.abort();
                previous.generation + 1
            }
            None => 0,
        };

        if let Err(e) = self.queue.pause().await {
            error!("Failed to pause queue {}: {}", self.queue.name(), e);
        }
        info!("Pausing queue {} for {:?}", self.queue.name(), duration);

        let until = Instant::now() + duration;
        let pauser = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(until).await;
            pauser.expire(generation).await;
        });
        *timer = Some(PauseTimer {
            generation,
            until,
            task,
        });
    }

    async fn expire(&self, generation: u64) {
        let mut timer = self.timer.lock().await;
        if timer.as_ref().map(|t| t.generation) != Some(generation) {
            return;
        }
        *timer = None;
        if let Err(e) = self.queue.resume().await {
            error!("Failed to resume queue {}: {}", self.queue.name(), e);
        } else {
            info!("Resumed queue {}", self.queue.name());
        }
    }

    async fn state(&self) -> PauseState {
        match self.timer.lock().await.as_ref() {
            Some(timer) => PauseState::Paused { until: timer.until },
            None => PauseState::Running,
        }
    }

    /// Drop the pending timer and resume now, so a paused flag does not
    /// outlive the consumer.
    async fn cancel(&self) {
        let Some(timer) = self.timer.lock().await.take() else {
            return;
        };
        timer.task.abort();
        if let Err(e) = self.queue.resume().await {
            error!("Failed to resume queue {}: {}", self.queue.name(), e);
        }
    }
}

/// Pulls jobs from the queue and executes them with bounded concurrency.
pub struct Consumer {
    queue: BoxedJobQueue,
    manager: Arc<BucketManager>,
    pauser: Arc<QueuePauser>,
    concurrency: Arc<Semaphore>,
}

impl Consumer {
    pub fn new(queue: BoxedJobQueue, manager: Arc<BucketManager>) -> Self {
        let max_concurrency = manager.config().max_concurrency.max(1);
        Self {
            pauser: QueuePauser::new(queue.clone()),
            queue,
            manager,
            concurrency: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    pub fn manager(&self) -> &Arc<BucketManager> {
        &self.manager
    }

    pub async fn state(&self) -> PauseState {
        self.pauser.state().await
    }

    /// Pause pulling for `duration`, replacing any pending pause.
    pub async fn pause_for(&self, duration: Duration) {
        self.pauser.pause_for(duration).await;
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// A pull in progress is allowed to finish, and every pulled job is run
    /// to completion before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        warn!(
            "Consuming queue {}: run exactly one consumer per API credential",
            self.queue.name()
        );

        let listener = self.spawn_event_listener();
        let mut tasks = JoinSet::new();

        loop {
            if stop_requested(&shutdown) {
                break;
            }
            let permit = tokio::select! {
                permit = self.concurrency.clone().acquire_owned() => permit?,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            // Never dropped midway: a remote queue may already have handed
            // the job over.
            let handle = match self.queue.next(PULL_WAIT).await {
                Ok(Pulled::Job(handle)) => handle,
                Ok(Pulled::Idle) => continue,
                Ok(Pulled::Closed) => {
                    info!("Queue {} closed", self.queue.name());
                    break;
                }
                Err(e) => {
                    error!("Failed to pull from {}: {}", self.queue.name(), e);
                    drop(permit);
                    sleep(QUEUE_ERROR_BACKOFF).await;
                    continue;
                }
            };

            // Taken here, in pull order, so tasks racing on other worker
            // threads cannot reorder a bucket.
            let ticket = self.manager.reserve(&handle.job().request);
            let manager = self.manager.clone();
            let queue = self.queue.clone();
            tasks.spawn(async move {
                let _permit = permit;
                process(&manager, &queue, handle, ticket).await;
            });

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!("Job task failed: {}", e);
                }
            }
        }

        debug!("Waiting for {} in-flight job(s)", tasks.len());
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                error!("Job task failed: {}", e);
            }
        }

        listener.abort();
        self.pauser.cancel().await;
        info!("Consumer for {} stopped", self.queue.name());
        Ok(())
    }

    fn spawn_event_listener(&self) -> JoinHandle<()> {
        let mut events = self.manager.subscribe();
        let pauser = self.pauser.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(duration) = event.global_pause() {
                            pauser.pause_for(duration).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Consumer missed {} dispatch event(s)", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue.name())
            .field("available_slots", &self.concurrency.available_permits())
            .finish_non_exhaustive()
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Execute one job and report its outcome. Never fails the consumer.
async fn process(
    manager: &BucketManager,
    queue: &BoxedJobQueue,
    handle: JobHandle,
    ticket: BucketTicket,
) {
    let request = handle.job().request.clone();
    let id = handle.job().id;

    let outcome = match manager.execute_reserved(request, ticket).await {
        Ok(response) => {
            debug!("Job {} finished with status {}", id, response.status);
            JobOutcome::Completed(response)
        }
        Err(e) => {
            warn!("Job {} failed: {}", id, e);
            JobOutcome::Failed(JobFailure::from(&e))
        }
    };

    if let Err(e) = queue.complete(handle, outcome).await {
        error!("Failed to complete job {}: {}", id, e);
    }
}
