//! Job handle: a pulled job that must be completed exactly once.

use super::Job;

/// A job pulled from the queue. Consumed by [`JobQueue::complete`](super::JobQueue::complete).
///
/// If dropped without being completed, logs a warning: the producer waiting
/// on the job will only see it as cancelled.
#[derive(Debug)]
pub struct JobHandle {
    job: Option<Job>,
}

impl JobHandle {
    pub fn new(job: Job) -> Self {
        Self { job: Some(job) }
    }

    pub fn job(&self) -> &Job {
        // Only `into_job` takes the job, and it consumes the handle.
        self.job.as_ref().expect("job handle already consumed")
    }

    /// Take the job out, marking the handle as consumed.
    pub fn into_job(mut self) -> Job {
        self.job.take().expect("job handle already consumed")
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if let Some(job) = &self.job {
            tracing::warn!(
                "JobHandle for {} ({} {}) dropped without being completed",
                job.id,
                job.request.method(),
                job.request.route
            );
        }
    }
}
