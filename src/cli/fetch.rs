//! The `fetch` command.

use std::sync::Arc;

use console::style;
use tokio::sync::watch;

use ratequeue::{
    ApiResponse, BucketManager, Consumer, DispatchConfig, Producer, RequestOptions,
    ReqwestTransport, ResponseBody,
};

use super::helpers::{open_queue, parse_header};
use super::icons::{error, success};

/// Submit one request and print the response.
///
/// With a broker configured the request goes to the shared queue and waits
/// for the running consumer. Otherwise a consumer is started in-process for
/// the duration of the call.
pub async fn cmd_fetch(
    config: DispatchConfig,
    method: &str,
    route: &str,
    body: Option<&str>,
    headers: &[String],
    include_headers: bool,
) -> anyhow::Result<()> {
    let mut options = RequestOptions::new(method);
    for raw in headers {
        let (name, value) = parse_header(raw)?;
        options = options.with_header(&name, &value);
    }
    if let Some(body) = body {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| anyhow::anyhow!("--body is not valid JSON: {}", e))?;
        options = options.with_body(value);
    }

    let queue = open_queue(&config).await?;
    let producer = Producer::new(queue.clone());

    let result = if config.broker_url.is_some() {
        producer.fetch(route, options, None).await
    } else {
        let transport = Arc::new(ReqwestTransport::from_config(&config)?);
        let manager = Arc::new(BucketManager::new(transport, config));
        let consumer = Consumer::new(queue, manager);
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(async move { consumer.run(shutdown).await });

        let result = producer.fetch(route, options, None).await;
        let _ = stop.send(true);
        running.await??;
        result
    };

    match result {
        Ok(response) => {
            print_response(&response, include_headers)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {} {} failed: {}", error(), method.to_uppercase(), route, e);
            Err(e.into())
        }
    }
}

fn print_response(response: &ApiResponse, include_headers: bool) -> anyhow::Result<()> {
    let status = if response.is_success() {
        style(response.status).green()
    } else {
        style(response.status).yellow()
    };
    eprintln!("{} {}", success(), status);

    if include_headers {
        for (name, value) in &response.headers {
            eprintln!("  {}: {}", style(name).dim(), value);
        }
    }

    match &response.body {
        ResponseBody::Json(value) => println!("{}", serde_json::to_string_pretty(value)?),
        ResponseBody::Text(text) => println!("{}", text),
        ResponseBody::Empty => {}
    }
    Ok(())
}
