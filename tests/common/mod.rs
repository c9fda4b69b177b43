//! Scripted transport and wiring shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use ratequeue::{
    ApiRequest, ApiResponse, BucketManager, Consumer, DispatchConfig, HttpTransport,
    InMemoryJobQueue, Producer, TransportError,
};

/// One scripted transport reply.
pub enum Reply {
    Respond(ApiResponse),
    /// Never answers; the request can only time out.
    Hang,
    Fail(TransportError),
}

/// A request as the transport saw it.
#[derive(Debug, Clone)]
pub struct Sent {
    pub route: String,
    pub method: String,
    pub attempt: u32,
    pub seq: Option<u64>,
    pub at: Instant,
}

/// Transport that plays back canned replies in order, then a fallback.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    fallback: ApiResponse,
    latency: Duration,
    sent: Mutex<Vec<Sent>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::with_fallback(response(200, &[], r#"{"ok":true}"#))
    }

    pub fn with_fallback(fallback: ApiResponse) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback,
            latency: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn respond(&self, status: u16, headers: &[(&str, &str)], body: &str) {
        self.push(Reply::Respond(response(status, headers, body)));
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        _timeout: Duration,
    ) -> Result<ApiResponse, TransportError> {
        self.sent.lock().unwrap().push(Sent {
            route: request.route.clone(),
            method: request.method().to_string(),
            attempt: request.attempts,
            seq: request
                .meta
                .as_ref()
                .and_then(|m| m.get("seq"))
                .and_then(|v| v.as_u64()),
            at: Instant::now(),
        });
        let reply = self.replies.lock().unwrap().pop_front();

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(Reply::Fail(err)) => Err(err),
            None => Ok(self.fallback.clone()),
        }
    }
}

pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> ApiResponse {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ApiResponse::from_parts(status, headers, body.as_bytes())
}

/// JSON 429 body as the remote API sends it.
pub fn rate_limited(retry_after_ms: u64, global: bool) -> ApiResponse {
    response(
        429,
        &[("content-type", "application/json")],
        &format!(
            r#"{{"message":"You are being rate limited.","retry_after":{},"global":{}}}"#,
            retry_after_ms, global
        ),
    )
}

pub fn manager(transport: Arc<ScriptedTransport>, config: DispatchConfig) -> Arc<BucketManager> {
    Arc::new(BucketManager::new(transport, config))
}

/// A running in-process producer/consumer pair.
pub struct Pipeline {
    pub producer: Producer,
    pub consumer: Arc<Consumer>,
    pub queue: Arc<InMemoryJobQueue>,
    pub manager: Arc<BucketManager>,
    pub stop: watch::Sender<bool>,
    pub running: JoinHandle<anyhow::Result<()>>,
}

impl Pipeline {
    pub fn start(transport: Arc<ScriptedTransport>, config: DispatchConfig) -> Self {
        let queue = Arc::new(InMemoryJobQueue::with_rate_limit(
            &config.queue_name,
            config.max_requests_per_second,
        ));
        let manager = manager(transport, config);
        let consumer = Arc::new(Consumer::new(queue.clone(), manager.clone()));
        let (stop, shutdown) = watch::channel(false);
        let running = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };
        Self {
            producer: Producer::new(queue.clone()),
            consumer,
            queue,
            manager,
            stop,
            running,
        }
    }

    pub async fn shutdown(self) {
        self.stop.send(true).unwrap();
        self.running.await.unwrap().unwrap();
    }
}
