//! HTTP transport seam.
//!
//! The bucket manager never talks to `reqwest` directly; it calls an
//! [`HttpTransport`], which keeps the rate-limit logic testable with scripted
//! fakes and lets deployments swap the client.

mod reqwest_transport;

pub use reqwest_transport::{ReqwestTransport, ReqwestTransportBuilder};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::request::{ApiRequest, ApiResponse};

/// Performs one HTTP exchange.
///
/// Implementations must resolve every HTTP status as `Ok`; only transport
/// faults (connect failure, timeout, protocol errors) are `Err`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: &ApiRequest,
        timeout: Duration,
    ) -> Result<ApiResponse, TransportError>;
}

/// Type alias for a shared transport.
pub type BoxedTransport = Arc<dyn HttpTransport>;
