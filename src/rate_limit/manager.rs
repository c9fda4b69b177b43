//! Bucket manager: paces requests per bucket and recovers from rate limits.
//!
//! Every request takes a ticket in its bucket's queue (FIFO), then waits
//! until no bucket block, global block or bucket reset is pending. 429s and
//! edge bans block the relevant scope and the request is retried
//! transparently; only exhausted timeouts and transport faults reach the
//! caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

use super::bucket::{Bucket, BucketState, BucketTicket};
use super::classifier::{is_invalid_status, ResponseClassifier, StandardClassifier, Verdict};
use super::events::{DispatchEvent, EVENT_CHANNEL_CAPACITY};
use super::global::GlobalBlock;
use super::invalid::InvalidRequestCounter;
use super::route::{bucket_key, route_key};
use crate::config::{DispatchConfig, INVALID_REQUEST_WINDOW};
use crate::error::{DispatchError, DispatchResult, TransportError};
use crate::http_client::BoxedTransport;
use crate::request::{ApiRequest, ApiResponse};

/// Bucket lookup tables.
#[derive(Default)]
struct Registry {
    /// Bucket key -> bucket. A bucket may be registered under several keys
    /// (its provisional route key and its discovered bucket key).
    buckets: HashMap<String, Arc<Bucket>>,
    /// Route key -> remote bucket id, learned from response headers.
    route_ids: HashMap<String, String>,
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    pub keys: Vec<String>,
    pub bucket_id: Option<String>,
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    pub reset_in: Option<Duration>,
    pub blocked_for: Option<Duration>,
    pub pending: usize,
}

/// Point-in-time view of the whole manager.
#[derive(Debug, Clone)]
pub struct DispatchStats {
    pub buckets: Vec<BucketSnapshot>,
    pub invalid_requests: usize,
    pub global_blocked_for: Option<Duration>,
}

/// Owns all bucket state and executes requests against the remote API.
pub struct BucketManager {
    transport: BoxedTransport,
    classifier: Arc<dyn ResponseClassifier>,
    config: DispatchConfig,
    registry: Mutex<Registry>,
    global: Arc<GlobalBlock>,
    invalid: Mutex<InvalidRequestCounter>,
    /// Wakes requests sleeping on a block when blocks are replaced.
    unblocked: Notify,
    events: broadcast::Sender<DispatchEvent>,
}

impl BucketManager {
    /// Create a manager using the [`StandardClassifier`].
    pub fn new(transport: BoxedTransport, config: DispatchConfig) -> Self {
        let classifier = Arc::new(StandardClassifier::new(config.retry_after_unit));
        Self::with_classifier(transport, classifier, config)
    }

    pub fn with_classifier(
        transport: BoxedTransport,
        classifier: Arc<dyn ResponseClassifier>,
        config: DispatchConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let invalid = InvalidRequestCounter::new(
            config.invalid_requests_threshold,
            INVALID_REQUEST_WINDOW,
        );
        Self {
            transport,
            classifier,
            config,
            registry: Mutex::new(Registry::default()),
            global: Arc::new(GlobalBlock::new()),
            invalid: Mutex::new(invalid),
            unblocked: Notify::new(),
            events,
        }
    }

    /// Subscribe to dispatch events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn global_block(&self) -> &Arc<GlobalBlock> {
        &self.global
    }

    /// Reserve the request's place in its bucket's queue.
    ///
    /// Places are served in the order they were reserved, so a caller that
    /// hands requests to concurrent tasks reserves before spawning them.
    pub fn reserve(&self, request: &ApiRequest) -> BucketTicket {
        self.resolve_bucket(request).reserve_turn()
    }

    /// Execute one request, waiting out any rate limits.
    ///
    /// Non-2xx responses are returned as `Ok`. Fails only when every attempt
    /// times out or the transport itself fails.
    pub async fn execute(&self, request: ApiRequest) -> DispatchResult<ApiResponse> {
        let ticket = self.reserve(&request);
        self.execute_reserved(request, ticket).await
    }

    /// Execute a request whose place was taken with [`reserve`](Self::reserve).
    pub async fn execute_reserved(
        &self,
        mut request: ApiRequest,
        ticket: BucketTicket,
    ) -> DispatchResult<ApiResponse> {
        let bucket = ticket.bucket().clone();
        let _turn = ticket.wait().await;
        let request_timeout = self.config.request_timeout();
        let mut timeouts = 0u32;

        loop {
            self.wait_until_ready(&bucket).await;

            bucket.consume();
            request.attempts += 1;

            let sent = timeout(
                request_timeout,
                self.transport.send(&request, request_timeout),
            )
            .await;

            let response = match sent {
                Ok(Ok(response)) => response,
                Err(_) | Ok(Err(TransportError::Timeout)) => {
                    timeouts += 1;
                    if timeouts > self.config.request_timeout_retries {
                        warn!(
                            "{} {} timed out {} time(s), giving up",
                            request.method(),
                            request.route,
                            timeouts
                        );
                        return Err(DispatchError::TimeoutExceeded {
                            route: request.route.clone(),
                            attempts: timeouts,
                        });
                    }
                    debug!(
                        "{} {} timed out after {:?}, retry {}/{}",
                        request.method(),
                        request.route,
                        request_timeout,
                        timeouts,
                        self.config.request_timeout_retries
                    );
                    continue;
                }
                Ok(Err(e)) => return Err(DispatchError::Transport(e.to_string())),
            };

            let headers = self.classifier.rate_limit_headers(&response);
            if let Some(bucket_id) = bucket.apply_headers(&headers) {
                self.register_bucket_id(&request, &bucket_id, &bucket);
            }

            let verdict = self.classifier.classify(&response);
            match &verdict {
                Verdict::Deliver => {}
                Verdict::RateLimited {
                    global: true,
                    retry_after,
                } => {
                    let blocked = self.config.scale_global_block(*retry_after);
                    warn!(
                        "Global rate limit on {} {}, blocking all buckets for {:?}",
                        request.method(),
                        request.route,
                        blocked
                    );
                    self.block_buckets_by_duration(blocked);
                    self.emit(DispatchEvent::GlobalRateLimit {
                        request: request.clone(),
                        blocked,
                    });
                }
                Verdict::RateLimited {
                    global: false,
                    retry_after,
                } => {
                    warn!(
                        "Bucket {} rate limited on {} {}, blocking for {:?}",
                        bucket.key(),
                        request.method(),
                        request.route,
                        retry_after
                    );
                    bucket.block_until(Instant::now() + *retry_after);
                    self.emit(DispatchEvent::RateLimit {
                        request: request.clone(),
                        bucket: bucket.key().to_string(),
                        blocked: *retry_after,
                    });
                }
                Verdict::EdgeBan { retry_after } => {
                    let blocked = self
                        .config
                        .scale_global_block(retry_after.unwrap_or(self.config.edge_ban_block()));
                    warn!(
                        "Edge network ban on {} {}, blocking all buckets for {:?}",
                        request.method(),
                        request.route,
                        blocked
                    );
                    self.block_buckets_by_duration(blocked);
                    self.emit(DispatchEvent::EdgeBan {
                        request: request.clone(),
                        blocked,
                    });
                }
            }

            // After the verdict's block so a threshold block is never shortened by it.
            if is_invalid_status(response.status) {
                self.record_invalid(&request);
            }

            if verdict == Verdict::Deliver {
                return Ok(response);
            }
        }
    }

    /// Block every bucket, existing or future, until now + `duration`.
    ///
    /// Latest call wins over earlier global blocks; `Duration::ZERO` lifts
    /// the global block. Bucket-local 429 blocks are kept, and a request
    /// waits for whichever of the two ends later.
    pub fn block_buckets_by_duration(&self, duration: Duration) {
        self.global.block_for(duration);
        self.unblocked.notify_waiters();
    }

    /// Snapshot every bucket and counter.
    pub fn stats(&self) -> DispatchStats {
        let registry = self.registry();
        let mut buckets: Vec<(Arc<Bucket>, Vec<String>)> = Vec::new();
        for (key, bucket) in &registry.buckets {
            match buckets.iter_mut().find(|(b, _)| Arc::ptr_eq(b, bucket)) {
                Some((_, keys)) => keys.push(key.clone()),
                None => buckets.push((bucket.clone(), vec![key.clone()])),
            }
        }
        drop(registry);

        let now = Instant::now();
        let buckets = buckets
            .into_iter()
            .map(|(bucket, mut keys)| {
                keys.sort();
                let BucketState {
                    remaining,
                    limit,
                    bucket_id,
                    ..
                } = bucket.snapshot();
                BucketSnapshot {
                    keys,
                    bucket_id,
                    remaining,
                    limit,
                    reset_in: bucket.reset_in(),
                    blocked_for: bucket
                        .blocked_until()
                        .map(|until| until.saturating_duration_since(now)),
                    pending: bucket.pending(),
                }
            })
            .collect();

        DispatchStats {
            buckets,
            invalid_requests: self.invalid().count(now),
            global_blocked_for: self.global.remaining(),
        }
    }

    fn resolve_bucket(&self, request: &ApiRequest) -> Arc<Bucket> {
        let route = route_key(request.method(), &request.route);
        let mut registry = self.registry();
        let key = match registry.route_ids.get(&route) {
            Some(id) => bucket_key(id, &request.route),
            None => route,
        };
        registry
            .buckets
            .entry(key)
            .or_insert_with_key(|key| {
                debug!("Creating bucket {}", key);
                Arc::new(Bucket::new(key))
            })
            .clone()
    }

    /// Remember the remote bucket id for this route and alias the bucket
    /// under its real key, so later requests share its queue and counters.
    fn register_bucket_id(&self, request: &ApiRequest, bucket_id: &str, bucket: &Arc<Bucket>) {
        let route = route_key(request.method(), &request.route);
        let key = bucket_key(bucket_id, &request.route);
        let mut registry = self.registry();
        registry.route_ids.insert(route.clone(), bucket_id.to_string());
        registry
            .buckets
            .entry(key.clone())
            .or_insert_with(|| bucket.clone());
        debug!("Route {} belongs to bucket {}", route, key);
    }

    /// Sleep until no bucket block, global block or bucket reset is pending.
    ///
    /// All three are re-read after every wake-up, so a block placed while the
    /// request waits on a reset is still honored.
    async fn wait_until_ready(&self, bucket: &Bucket) {
        loop {
            // Register before reading deadlines so a replaced block is not missed.
            let notified = self.unblocked.notified();

            let until = [
                bucket.blocked_until(),
                self.global.blocked_until(),
                bucket.exhausted_until(),
            ]
            .into_iter()
            .flatten()
            .max();
            let Some(until) = until else {
                return;
            };

            debug!(
                "Bucket {} waiting {:?} before sending",
                bucket.key(),
                until.saturating_duration_since(Instant::now())
            );
            tokio::select! {
                _ = sleep_until(until) => {}
                _ = notified => {}
            }
        }
    }

    fn record_invalid(&self, request: &ApiRequest) {
        let tally = self.invalid().record(Instant::now());
        self.emit(DispatchEvent::InvalidRequest {
            request: request.clone(),
            count: tally.count,
        });

        if tally.crossed {
            let blocked = if self.config.delay_on_invalid_threshold {
                let blocked = self.config.invalid_threshold_block();
                self.block_buckets_by_duration(blocked);
                blocked
            } else {
                Duration::ZERO
            };
            warn!(
                "{} invalid requests within {:?}, blocking for {:?}",
                tally.count, INVALID_REQUEST_WINDOW, blocked
            );
            self.emit(DispatchEvent::InvalidRequestsThreshold {
                threshold: self.config.invalid_requests_threshold,
                blocked,
            });
        }
    }

    fn emit(&self, event: DispatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn invalid(&self) -> MutexGuard<'_, InvalidRequestCounter> {
        self.invalid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
