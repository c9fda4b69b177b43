//! Dispatch configuration.
//!
//! Values come from defaults, an optional TOML file, `RATEQUEUE_*`
//! environment variables and finally CLI flags, in that order of precedence.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Length of the trailing window for invalid-request accounting, and the
/// base duration of the block applied when the threshold is crossed.
pub const INVALID_REQUEST_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Default queue name shared by producers and the consumer.
pub const DEFAULT_QUEUE_NAME: &str = "ratequeue:requests";

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "RATEQUEUE_CONFIG";

/// Unit of the `retry_after` value in rate-limit response bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAfterUnit {
    #[default]
    Millis,
    Seconds,
}

impl RetryAfterUnit {
    pub fn to_duration(self, value: f64) -> Duration {
        let secs = match self {
            RetryAfterUnit::Millis => value / 1000.0,
            RetryAfterUnit::Seconds => value,
        };
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
    }
}

/// Configuration for the bucket manager, consumer and HTTP transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Invalid (401/403/429) responses per 10 minutes before blocking everything.
    pub invalid_requests_threshold: u32,
    /// Whether crossing the invalid-request threshold blocks buckets and the queue.
    pub delay_on_invalid_threshold: bool,
    /// Per-attempt HTTP timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Extra attempts after a timeout before giving up.
    pub request_timeout_retries: u32,
    /// Scales every global block duration.
    pub global_block_duration_multiple: f64,
    /// Jobs admitted per second by the queue.
    pub max_requests_per_second: u32,
    /// Executions in flight at once inside the consumer.
    pub max_concurrency: usize,
    /// Global block applied on an edge-network ban without a retry-after header.
    pub edge_ban_block_ms: u64,
    /// Time a watching producer allows for queueing and rate-limit waits on
    /// top of every attempt's timeout before giving up on a remote result.
    pub result_wait_allowance_ms: u64,
    pub retry_after_unit: RetryAfterUnit,
    pub queue_name: String,
    /// Prefix joined with each route. Routes must be absolute URLs when unset.
    pub base_url: Option<String>,
    /// Value of the Authorization header sent with every request.
    #[serde(skip_serializing)]
    pub authorization: Option<String>,
    pub user_agent: String,
    /// Broker URL (None = in-process queue, "redis://..." = Redis).
    pub broker_url: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            invalid_requests_threshold: 5000,
            delay_on_invalid_threshold: true,
            request_timeout_ms: 10_000,
            request_timeout_retries: 3,
            global_block_duration_multiple: 1.0,
            max_requests_per_second: 50,
            max_concurrency: 50,
            edge_ban_block_ms: 60 * 60 * 1000,
            result_wait_allowance_ms: 10 * 60 * 1000,
            retry_after_unit: RetryAfterUnit::Millis,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            base_url: None,
            authorization: None,
            user_agent: concat!("ratequeue/", env!("CARGO_PKG_VERSION")).to_string(),
            broker_url: None,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from an optional TOML file plus environment overrides.
    ///
    /// When `path` is `None`, `RATEQUEUE_CONFIG` is consulted.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = env::var(CONFIG_PATH_ENV).ok();
        let path = path.or(env_path.as_deref().map(Path::new));

        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };

        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Apply `RATEQUEUE_*` environment variable overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        override_from_env("RATEQUEUE_INVALID_REQUESTS_THRESHOLD", &mut self.invalid_requests_threshold);
        override_from_env("RATEQUEUE_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        override_from_env("RATEQUEUE_REQUEST_TIMEOUT_RETRIES", &mut self.request_timeout_retries);
        override_from_env(
            "RATEQUEUE_GLOBAL_BLOCK_DURATION_MULTIPLE",
            &mut self.global_block_duration_multiple,
        );
        override_from_env("RATEQUEUE_MAX_REQUESTS_PER_SECOND", &mut self.max_requests_per_second);
        override_from_env("RATEQUEUE_MAX_CONCURRENCY", &mut self.max_concurrency);
        override_from_env("RATEQUEUE_EDGE_BAN_BLOCK_MS", &mut self.edge_ban_block_ms);
        override_from_env(
            "RATEQUEUE_RESULT_WAIT_ALLOWANCE_MS",
            &mut self.result_wait_allowance_ms,
        );

        if let Ok(v) = env::var("RATEQUEUE_DELAY_ON_INVALID_THRESHOLD") {
            self.delay_on_invalid_threshold = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("RATEQUEUE_QUEUE_NAME") {
            self.queue_name = v;
        }
        if let Ok(v) = env::var("RATEQUEUE_BASE_URL") {
            self.base_url = Some(v);
        }
        if let Ok(v) = env::var("RATEQUEUE_AUTHORIZATION") {
            self.authorization = Some(v);
        }
        if let Ok(v) = env::var("RATEQUEUE_BROKER_URL") {
            self.broker_url = Some(v);
        }

        self
    }

    /// Reject values that would stall or spin the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_requests_per_second == 0 {
            return Err(ConfigError::Invalid {
                key: "max_requests_per_second",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "max_concurrency",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(self.global_block_duration_multiple.is_finite()
            && self.global_block_duration_multiple > 0.0)
        {
            return Err(ConfigError::Invalid {
                key: "global_block_duration_multiple",
                reason: format!(
                    "must be a positive number, got {}",
                    self.global_block_duration_multiple
                ),
            });
        }
        if self.invalid_requests_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "invalid_requests_threshold",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Scale a global block duration by `global_block_duration_multiple`.
    pub fn scale_global_block(&self, duration: Duration) -> Duration {
        duration.mul_f64(self.global_block_duration_multiple)
    }

    /// Block applied to buckets and the queue when the invalid threshold is crossed.
    pub fn invalid_threshold_block(&self) -> Duration {
        self.scale_global_block(INVALID_REQUEST_WINDOW)
    }

    pub fn edge_ban_block(&self) -> Duration {
        Duration::from_millis(self.edge_ban_block_ms)
    }

    /// How long a producer waits on a remote consumer for one result:
    /// every attempt timing out, plus the queueing allowance.
    pub fn result_timeout(&self) -> Duration {
        self.request_timeout() * (self.request_timeout_retries + 1)
            + Duration::from_millis(self.result_wait_allowance_ms)
    }

    /// Render the effective configuration as TOML (authorization omitted).
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn override_from_env<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(raw) = env::var(var) {
        match raw.parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!("Ignoring unparseable {}={:?}", var, raw),
        }
    }
}
