//! Error types surfaced to callers of the dispatch pipeline.
//!
//! Rate-limit conditions never appear here: the bucket manager recovers from
//! them internally and reports them as [`DispatchEvent`](crate::rate_limit::DispatchEvent)s.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::work_queue::QueueError;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failures a producer can observe for one request.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Request to {route} timed out after {attempts} attempt(s)")]
    TimeoutExceeded { route: String, attempts: u32 },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Job submission failed: {0}")]
    Submission(#[from] QueueError),
    #[error("Job was dropped before completing")]
    Cancelled,
}

/// Errors from an [`HttpTransport`](crate::http_client::HttpTransport).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("{0}")]
    Other(String),
}

/// Serializable failure attached to a job so it survives a wire transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: JobFailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFailureKind {
    Timeout,
    Transport,
    Cancelled,
}

impl From<&DispatchError> for JobFailure {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::TimeoutExceeded { route, attempts } => JobFailure {
                kind: JobFailureKind::Timeout,
                message: err.to_string(),
                route: Some(route.clone()),
                attempts: *attempts,
            },
            DispatchError::Cancelled => JobFailure {
                kind: JobFailureKind::Cancelled,
                message: err.to_string(),
                route: None,
                attempts: 0,
            },
            DispatchError::Transport(_) | DispatchError::Submission(_) => JobFailure {
                kind: JobFailureKind::Transport,
                message: err.to_string(),
                route: None,
                attempts: 0,
            },
        }
    }
}

impl From<JobFailure> for DispatchError {
    fn from(failure: JobFailure) -> Self {
        match failure.kind {
            JobFailureKind::Timeout => DispatchError::TimeoutExceeded {
                route: failure.route.unwrap_or_default(),
                attempts: failure.attempts,
            },
            JobFailureKind::Transport => DispatchError::Transport(failure.message),
            JobFailureKind::Cancelled => DispatchError::Cancelled,
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
