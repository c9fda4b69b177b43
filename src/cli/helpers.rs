//! Shared helpers for CLI commands.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::sync::watch;
use tracing::info;

use ratequeue::{BoxedJobQueue, DispatchConfig, InMemoryJobQueue};

/// `Name: value`, where the name is an RFC 9110 token.
static HEADER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([!#$%&'*+.^_`|~0-9A-Za-z-]+)\s*:\s*(.*)$").unwrap()
});

/// Parse a `--header` argument.
pub fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let caps = HEADER_PATTERN
        .captures(raw.trim())
        .ok_or_else(|| anyhow::anyhow!("Invalid header '{}', expected 'Name: value'", raw))?;
    Ok((caps[1].to_string(), caps[2].trim().to_string()))
}

/// Open the job queue named in the configuration.
///
/// No broker URL means an in-process queue, which only reaches a consumer
/// running in the same process.
pub async fn open_queue(config: &DispatchConfig) -> anyhow::Result<BoxedJobQueue> {
    match config.broker_url.as_deref() {
        None => Ok(Arc::new(InMemoryJobQueue::with_rate_limit(
            &config.queue_name,
            config.max_requests_per_second,
        ))),
        #[cfg(feature = "redis-backend")]
        Some(url) => {
            let queue = ratequeue::RedisJobQueue::connect(url, &config.queue_name)
                .await?
                .with_rate_limit(config.max_requests_per_second)
                .with_result_timeout(config.result_timeout());
            info!("Connected to broker for queue {}", config.queue_name);
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "redis-backend"))]
        Some(url) => anyhow::bail!(
            "Broker '{}' requires building with the redis-backend feature",
            url
        ),
    }
}

/// Shutdown channel flipped by Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing in-flight jobs");
            let _ = tx.send(true);
        }
        // Keep the sender alive; dropping it would also stop the consumer.
        std::future::pending::<()>().await;
    });
    rx
}
