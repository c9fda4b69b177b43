//! ratequeue - rate-limit-aware HTTP dispatch queue.
//!
//! Producers submit API requests to a shared job queue. A single consumer
//! pulls them and executes each through the [`BucketManager`], which paces
//! requests per rate-limit bucket, honors global blocks and retries 429s
//! and timeouts transparently.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ratequeue::{
//!     BucketManager, Consumer, DispatchConfig, InMemoryJobQueue, Producer, RequestOptions,
//!     ReqwestTransport,
//! };
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = DispatchConfig::default();
//! let queue = Arc::new(InMemoryJobQueue::with_rate_limit(
//!     &config.queue_name,
//!     config.max_requests_per_second,
//! ));
//! let transport = Arc::new(ReqwestTransport::from_config(&config)?);
//! let manager = Arc::new(BucketManager::new(transport, config));
//!
//! let consumer = Consumer::new(queue.clone(), manager);
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! tokio::spawn(async move { consumer.run(shutdown).await });
//!
//! let producer = Producer::new(queue);
//! let response = producer
//!     .fetch("/channels/1/messages", RequestOptions::get(), None)
//!     .await?;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod http_client;
pub mod producer;
pub mod rate_limit;
pub mod request;
pub mod work_queue;

pub use config::{DispatchConfig, RetryAfterUnit};
pub use consumer::{Consumer, PauseState};
pub use error::{ConfigError, DispatchError, DispatchResult, JobFailure, TransportError};
pub use http_client::{BoxedTransport, HttpTransport, ReqwestTransport};
pub use producer::Producer;
pub use rate_limit::{BucketManager, DispatchEvent, DispatchStats, ResponseClassifier, Verdict};
pub use request::{ApiRequest, ApiResponse, Meta, RequestOptions, ResponseBody};
pub use work_queue::{
    BoxedJobQueue, InMemoryJobQueue, Job, JobOutcome, JobQueue, Pulled, QueueError,
};

#[cfg(feature = "redis-backend")]
pub use work_queue::RedisJobQueue;
