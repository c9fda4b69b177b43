//! The `consume` command.

use std::sync::Arc;

use console::style;

use ratequeue::rate_limit::spawn_event_logger;
use ratequeue::{BucketManager, Consumer, DispatchConfig, ReqwestTransport};

use super::helpers::{open_queue, shutdown_on_ctrl_c};
use super::icons::{dim_arrow, info, success};

/// Run the consumer until Ctrl-C.
pub async fn cmd_consume(config: DispatchConfig) -> anyhow::Result<()> {
    if config.broker_url.is_none() {
        anyhow::bail!(
            "No broker configured. Set RATEQUEUE_BROKER_URL or --broker so producers can reach this consumer."
        );
    }

    let queue = open_queue(&config).await?;
    let transport = Arc::new(ReqwestTransport::from_config(&config)?);

    eprintln!(
        "{} Consuming {} ({} req/s, {} in flight)",
        info(),
        style(&config.queue_name).bold(),
        config.max_requests_per_second,
        config.max_concurrency
    );
    if let Some(ref base) = config.base_url {
        eprintln!("  {} Base URL: {}", dim_arrow(), base);
    }

    let manager = Arc::new(BucketManager::new(transport, config));
    let logger = spawn_event_logger(manager.subscribe());
    let consumer = Consumer::new(queue, manager.clone());

    consumer.run(shutdown_on_ctrl_c()).await?;
    logger.abort();

    let stats = manager.stats();
    eprintln!(
        "{} Stopped ({} bucket(s) seen, {} invalid request(s) in window)",
        success(),
        stats.buckets.len(),
        stats.invalid_requests
    );
    Ok(())
}
