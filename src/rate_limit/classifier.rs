//! Response classification.
//!
//! The remote API's rate-limit conventions (header names, how a global limit
//! is flagged, what an edge-network ban looks like) are an external contract,
//! so they sit behind [`ResponseClassifier`] instead of being parsed inline by
//! the bucket manager.

use std::time::Duration;

use crate::config::RetryAfterUnit;
use crate::request::{ApiResponse, ResponseBody};

/// Fallback wait for a 429 that carries no retry-after information.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Rate-limit state reported by one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    /// Time from now until the bucket refills.
    pub reset_after: Option<Duration>,
    /// Remote bucket identity.
    pub bucket: Option<String>,
}

impl RateLimitHeaders {
    pub fn is_empty(&self) -> bool {
        self.remaining.is_none()
            && self.limit.is_none()
            && self.reset_after.is_none()
            && self.bucket.is_none()
    }
}

/// What the bucket manager should do with a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Return to the caller as-is (success or ordinary error status).
    Deliver,
    /// 429 from the API; retry after the block.
    RateLimited { global: bool, retry_after: Duration },
    /// Edge-network ban; `retry_after` is set only when the edge said so.
    EdgeBan { retry_after: Option<Duration> },
}

/// Interprets the remote API's rate-limit conventions.
pub trait ResponseClassifier: Send + Sync {
    /// Extract bucket state from response headers.
    fn rate_limit_headers(&self, response: &ApiResponse) -> RateLimitHeaders;

    /// Decide how the response should be handled.
    fn classify(&self, response: &ApiResponse) -> Verdict;
}

/// Statuses counted toward the invalid-request threshold.
pub fn is_invalid_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429)
}

/// Classifier for APIs that follow the common `X-RateLimit-*` header scheme.
///
/// A 429 is global when `x-ratelimit-global: true`, `x-ratelimit-scope: global`
/// or a JSON body with `"global": true` says so. A 429 with a non-JSON body
/// and no rate-limit headers came from the edge network, not the API.
#[derive(Debug, Clone, Default)]
pub struct StandardClassifier {
    retry_after_unit: RetryAfterUnit,
}

impl StandardClassifier {
    pub fn new(retry_after_unit: RetryAfterUnit) -> Self {
        Self { retry_after_unit }
    }

    fn header_f64(response: &ApiResponse, name: &str) -> Option<f64> {
        response
            .header(name)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    fn seconds(value: f64) -> Option<Duration> {
        Duration::try_from_secs_f64(value.max(0.0)).ok()
    }

    fn is_global(response: &ApiResponse) -> bool {
        let header_global = response
            .header("x-ratelimit-global")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let scope_global = response
            .header("x-ratelimit-scope")
            .is_some_and(|v| v.eq_ignore_ascii_case("global"));
        let body_global = response
            .body
            .as_json()
            .and_then(|b| b.get("global"))
            .and_then(|g| g.as_bool())
            .unwrap_or(false);
        header_global || scope_global || body_global
    }

    fn retry_after(&self, response: &ApiResponse) -> Option<Duration> {
        if let Some(value) = response
            .body
            .as_json()
            .and_then(|b| b.get("retry_after"))
            .and_then(|v| v.as_f64())
        {
            return Some(self.retry_after_unit.to_duration(value));
        }
        Self::header_f64(response, "retry-after")
            .or_else(|| Self::header_f64(response, "x-ratelimit-reset-after"))
            .and_then(Self::seconds)
    }

    fn has_rate_limit_headers(response: &ApiResponse) -> bool {
        response.headers.keys().any(|k| k.starts_with("x-ratelimit"))
    }
}

impl ResponseClassifier for StandardClassifier {
    fn rate_limit_headers(&self, response: &ApiResponse) -> RateLimitHeaders {
        RateLimitHeaders {
            remaining: response
                .header("x-ratelimit-remaining")
                .and_then(|v| v.trim().parse().ok()),
            limit: response
                .header("x-ratelimit-limit")
                .and_then(|v| v.trim().parse().ok()),
            reset_after: Self::header_f64(response, "x-ratelimit-reset-after")
                .and_then(Self::seconds),
            bucket: response
                .header("x-ratelimit-bucket")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }

    fn classify(&self, response: &ApiResponse) -> Verdict {
        if response.status != 429 {
            return Verdict::Deliver;
        }

        if !response.body.is_json()
            && !matches!(response.body, ResponseBody::Empty)
            && !Self::has_rate_limit_headers(response)
        {
            return Verdict::EdgeBan {
                retry_after: Self::header_f64(response, "retry-after").and_then(Self::seconds),
            };
        }

        Verdict::RateLimited {
            global: Self::is_global(response),
            retry_after: self.retry_after(response).unwrap_or(DEFAULT_RETRY_AFTER),
        }
    }
}
