//! Signals emitted by the bucket manager.
//!
//! Subscribers (the consumer, loggers, metrics) receive them over a
//! `tokio::sync::broadcast` channel; the manager does not know who listens.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::request::ApiRequest;

/// Capacity of the event channel. Slow subscribers skip ahead on overflow.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// Bucket-local 429; only `bucket` is blocked.
    RateLimit {
        request: ApiRequest,
        bucket: String,
        blocked: Duration,
    },
    /// Global 429; every bucket is blocked.
    GlobalRateLimit {
        request: ApiRequest,
        blocked: Duration,
    },
    /// A 401, 403 or 429 was received. `count` is the running total in the window.
    InvalidRequest { request: ApiRequest, count: usize },
    /// The invalid-request threshold was crossed. `blocked` is zero when
    /// delaying on the threshold is disabled.
    InvalidRequestsThreshold { threshold: u32, blocked: Duration },
    /// The edge network rejected the request; every bucket is blocked.
    EdgeBan {
        request: ApiRequest,
        blocked: Duration,
    },
}

impl DispatchEvent {
    /// Duration the whole pipeline should stay paused for, if this event
    /// calls for a global pause.
    pub fn global_pause(&self) -> Option<Duration> {
        match self {
            DispatchEvent::GlobalRateLimit { blocked, .. }
            | DispatchEvent::EdgeBan { blocked, .. } => Some(*blocked),
            DispatchEvent::InvalidRequestsThreshold { blocked, .. } if !blocked.is_zero() => {
                Some(*blocked)
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatchEvent::RateLimit { .. } => "rate_limit",
            DispatchEvent::GlobalRateLimit { .. } => "global_rate_limit",
            DispatchEvent::InvalidRequest { .. } => "invalid_request",
            DispatchEvent::InvalidRequestsThreshold { .. } => "invalid_requests_threshold",
            DispatchEvent::EdgeBan { .. } => "edge_ban",
        }
    }
}

/// Log every event until the channel closes.
pub fn spawn_event_logger(mut events: broadcast::Receiver<DispatchEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event logger fell behind, skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &DispatchEvent) {
    match event {
        DispatchEvent::RateLimit {
            request,
            bucket,
            blocked,
        } => info!(
            "Bucket {} rate limited on {} {}, blocked for {:?}",
            bucket,
            request.method(),
            request.route,
            blocked
        ),
        DispatchEvent::GlobalRateLimit { request, blocked } => warn!(
            "Global rate limit hit on {} {}, all buckets blocked for {:?}",
            request.method(),
            request.route,
            blocked
        ),
        DispatchEvent::InvalidRequest { request, count } => debug!(
            "Invalid request #{} in window: {} {}",
            count,
            request.method(),
            request.route
        ),
        DispatchEvent::InvalidRequestsThreshold { threshold, blocked } => warn!(
            "Invalid request threshold of {} crossed, blocking for {:?}",
            threshold, blocked
        ),
        DispatchEvent::EdgeBan { request, blocked } => warn!(
            "Edge network ban on {} {}, all buckets blocked for {:?}",
            request.method(),
            request.route,
            blocked
        ),
    }
}
