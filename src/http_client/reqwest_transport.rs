//! `reqwest`-backed transport.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use url::Url;

use super::HttpTransport;
use crate::config::DispatchConfig;
use crate::error::TransportError;
use crate::request::{ApiRequest, ApiResponse};

/// HTTP transport that sends requests with a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: Option<String>,
    authorization: Option<String>,
}

/// Builder for [`ReqwestTransport`].
pub struct ReqwestTransportBuilder {
    user_agent: String,
    base_url: Option<String>,
    authorization: Option<String>,
}

impl ReqwestTransportBuilder {
    /// Prefix joined with every relative route.
    pub fn base_url(mut self, base_url: &str) -> Self {
        self.base_url = Some(base_url.to_string());
        self
    }

    /// Authorization header value sent unless the request sets its own.
    pub fn authorization(mut self, value: &str) -> Self {
        self.authorization = Some(value.to_string());
        self
    }

    pub fn user_agent(mut self, ua: &str) -> Self {
        self.user_agent = ua.to_string();
        self
    }

    pub fn build(self) -> Result<ReqwestTransport, TransportError> {
        if let Some(ref base) = self.base_url {
            Url::parse(base).map_err(|e| {
                TransportError::Other(format!("Invalid base URL '{}': {}", base, e))
            })?;
        }

        // Timeouts are applied per request so retries can use the configured value.
        let client = Client::builder()
            .user_agent(&self.user_agent)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| TransportError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(ReqwestTransport {
            client,
            base_url: self.base_url,
            authorization: self.authorization,
        })
    }
}

impl ReqwestTransport {
    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder {
            user_agent: DispatchConfig::default().user_agent,
            base_url: None,
            authorization: None,
        }
    }

    /// Build a transport from the dispatch configuration.
    pub fn from_config(config: &DispatchConfig) -> Result<Self, TransportError> {
        let mut builder = Self::builder().user_agent(&config.user_agent);
        if let Some(ref base) = config.base_url {
            builder = builder.base_url(base);
        }
        if let Some(ref auth) = config.authorization {
            builder = builder.authorization(auth);
        }
        builder.build()
    }

    /// Resolve a route against the base URL.
    pub fn resolve_url(&self, route: &str) -> Result<Url, TransportError> {
        if let Ok(url) = Url::parse(route) {
            return Ok(url);
        }
        let base = self.base_url.as_deref().ok_or_else(|| {
            TransportError::Other(format!(
                "Route '{}' is relative but no base URL is configured",
                route
            ))
        })?;
        let joined = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            route.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|e| TransportError::Other(format!("Invalid URL '{}': {}", joined, e)))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connection(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        timeout: Duration,
    ) -> Result<ApiResponse, TransportError> {
        let url = self.resolve_url(&request.route)?;
        let method = Method::from_bytes(request.method().as_bytes()).map_err(|e| {
            TransportError::Other(format!("Invalid method '{}': {}", request.method(), e))
        })?;

        let mut builder = self.client.request(method, url).timeout(timeout);

        let has_auth = request
            .options
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("authorization"));
        if let (Some(auth), false) = (&self.authorization, has_auth) {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        for (name, value) in &request.options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = request.options.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(ApiResponse::from_parts(status, headers, &bytes))
    }
}
