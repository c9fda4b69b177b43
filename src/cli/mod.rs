//! CLI parser and command dispatch.

mod config_cmd;
mod consume;
mod fetch;
mod helpers;
mod icons;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ratequeue::DispatchConfig;

#[derive(Parser)]
#[command(name = "ratequeue")]
#[command(about = "Rate-limit-aware HTTP dispatch queue")]
#[command(version)]
pub struct Cli {
    /// Config file path (falls back to RATEQUEUE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base URL joined with relative routes (overrides config)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Broker URL, e.g. redis://localhost:6379 (overrides config)
    #[arg(long, global = true)]
    broker: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the single consumer against the configured broker
    Consume {
        /// Executions in flight at once
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Jobs pulled per second
        #[arg(long)]
        max_requests_per_second: Option<u32>,
    },

    /// Submit one request and print the response
    Fetch {
        /// HTTP method (GET, POST, ...)
        method: String,
        /// Route relative to the base URL, or an absolute URL
        route: String,
        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
        /// Extra header as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Print response headers too
        #[arg(short, long)]
        include: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DispatchConfig::load(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        config.base_url = Some(base_url);
    }
    if let Some(broker) = cli.broker {
        config.broker_url = Some(broker);
    }

    match cli.command {
        Commands::Consume {
            max_concurrency,
            max_requests_per_second,
        } => {
            if let Some(n) = max_concurrency {
                config.max_concurrency = n;
            }
            if let Some(n) = max_requests_per_second {
                config.max_requests_per_second = n;
            }
            config.validate()?;
            consume::cmd_consume(config).await
        }
        Commands::Fetch {
            method,
            route,
            body,
            headers,
            include,
        } => {
            fetch::cmd_fetch(config, &method, &route, body.as_deref(), &headers, include).await
        }
        Commands::Config => config_cmd::cmd_config_show(&config),
    }
}
