//! Producer side: submits requests and optionally awaits their results.

use tracing::debug;

use crate::error::{DispatchError, DispatchResult};
use crate::request::{ApiRequest, ApiResponse, Meta, RequestOptions};
use crate::work_queue::{BoxedJobQueue, Job, JobOutcome};

/// Submits API requests to the job queue. Holds no state besides the queue.
#[derive(Clone)]
pub struct Producer {
    queue: BoxedJobQueue,
}

impl Producer {
    pub fn new(queue: BoxedJobQueue) -> Self {
        Self { queue }
    }

    /// Submit a request without waiting for it to run.
    ///
    /// Returns once the queue has accepted the job.
    pub async fn enqueue(
        &self,
        route: &str,
        options: RequestOptions,
        meta: Option<Meta>,
    ) -> DispatchResult<Job> {
        let job = Job::new(self.queue.name(), ApiRequest::new(route, options, meta));
        self.queue.submit(job.clone()).await?;
        debug!("Enqueued job {} for {} {}", job.id, job.request.method(), route);
        Ok(job)
    }

    /// Submit a request and wait for the consumer to finish it.
    ///
    /// Any HTTP status is a successful result; rate limits have already been
    /// waited out. Fails on exhausted timeouts or transport errors.
    pub async fn fetch(
        &self,
        route: &str,
        options: RequestOptions,
        meta: Option<Meta>,
    ) -> DispatchResult<ApiResponse> {
        let job = Job::new(self.queue.name(), ApiRequest::new(route, options, meta));
        let id = job.id;
        let completion = self.queue.submit_and_watch(job).await?;
        debug!("Waiting on job {} for {}", id, route);

        match completion.await {
            Ok(JobOutcome::Completed(response)) => Ok(response),
            Ok(JobOutcome::Failed(failure)) => Err(failure.into()),
            Err(_) => Err(DispatchError::Cancelled),
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("queue", &self.queue.name())
            .finish()
    }
}
