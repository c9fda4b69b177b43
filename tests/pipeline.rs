//! Producer -> queue -> consumer round trips on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use common::{rate_limited, response, Pipeline, Reply, ScriptedTransport};
use ratequeue::{
    DispatchConfig, DispatchError, DispatchEvent, JobQueue, Meta, PauseState, RequestOptions,
};

fn paused_until(state: PauseState) -> Instant {
    match state {
        PauseState::Paused { until } => until,
        PauseState::Running => panic!("expected the consumer to be paused"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_fetch_round_trip() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.respond(
        200,
        &[("content-type", "application/json")],
        r#"{"id":"42","content":"hello"}"#,
    );
    let pipeline = Pipeline::start(transport.clone(), DispatchConfig::default());

    let response = pipeline
        .producer
        .fetch(
            "/channels/1/messages",
            RequestOptions::post(serde_json::json!({"content": "hello"})),
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_json().unwrap()["id"], "42");
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "POST");

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fetch_rejects_after_timeouts() {
    let transport = Arc::new(ScriptedTransport::new());
    for _ in 0..4 {
        transport.push(Reply::Hang);
    }
    let pipeline = Pipeline::start(transport.clone(), DispatchConfig::default());
    let start = Instant::now();

    let err = pipeline
        .producer
        .fetch("/channels/1/typing", RequestOptions::post(serde_json::json!({})), None)
        .await
        .unwrap_err();

    match err {
        DispatchError::TimeoutExceeded { route, attempts } => {
            assert_eq!(route, "/channels/1/typing");
            assert_eq!(attempts, 4);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    // One attempt plus three retries, 10s each.
    assert!(start.elapsed() >= Duration::from_secs(40));
    assert_eq!(transport.sent().len(), 4);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_enqueued_jobs_run_in_order() {
    let transport = Arc::new(ScriptedTransport::new().latency(Duration::from_millis(20)));
    let pipeline = Pipeline::start(transport.clone(), DispatchConfig::default());

    for i in 0..8u64 {
        let mut meta = Meta::new();
        meta.insert("seq".to_string(), serde_json::json!(i));
        pipeline
            .producer
            .enqueue("/channels/77/messages", RequestOptions::get(), Some(meta))
            .await
            .unwrap();
    }

    while transport.sent().len() < 8 {
        sleep(Duration::from_millis(10)).await;
    }
    let order: Vec<u64> = transport.sent().iter().filter_map(|s| s.seq).collect();
    assert_eq!(order, (0..8).collect::<Vec<_>>());

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_enqueued_jobs_run_in_order_across_worker_threads() {
    let transport = Arc::new(ScriptedTransport::new());
    let config = DispatchConfig {
        max_requests_per_second: 10_000,
        ..Default::default()
    };
    let pipeline = Pipeline::start(transport.clone(), config);

    for i in 0..400u64 {
        let mut meta = Meta::new();
        meta.insert("seq".to_string(), serde_json::json!(i));
        pipeline
            .producer
            .enqueue("/channels/9/messages", RequestOptions::get(), Some(meta))
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(30), async {
        while transport.sent().len() < 400 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all jobs should run");
    let order: Vec<u64> = transport.sent().iter().filter_map(|s| s.seq).collect();
    assert_eq!(order, (0..400).collect::<Vec<_>>());

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_global_limit_replaces_pause() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push(Reply::Respond(rate_limited(60_000, true)));
    transport.push(Reply::Respond(rate_limited(5_000, true)));
    let pipeline = Pipeline::start(transport.clone(), DispatchConfig::default());
    let start = Instant::now();

    let fetch = {
        let producer = pipeline.producer.clone();
        tokio::spawn(async move {
            producer
                .fetch("/channels/1/messages", RequestOptions::get(), None)
                .await
        })
    };

    sleep(Duration::from_secs(30)).await;
    let until = paused_until(pipeline.consumer.state().await);
    assert_eq!(until.duration_since(start), Duration::from_secs(60));
    assert!(pipeline.queue.is_paused().await.unwrap());

    // The retry at 60s hits a second global limit of 5s.
    sleep(Duration::from_secs(32)).await;
    let until = paused_until(pipeline.consumer.state().await);
    assert_eq!(until.duration_since(start), Duration::from_secs(65));

    let response = fetch.await.unwrap().unwrap();
    assert_eq!(response.status, 200);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(pipeline.consumer.state().await, PauseState::Running);
    assert!(!pipeline.queue.is_paused().await.unwrap());

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_threshold_pauses_queue() {
    let transport = Arc::new(ScriptedTransport::with_fallback(response(403, &[], "")));
    let config = DispatchConfig {
        invalid_requests_threshold: 20,
        ..Default::default()
    };
    let pipeline = Pipeline::start(transport.clone(), config);
    let mut events = pipeline.manager.subscribe();
    let start = Instant::now();

    for _ in 0..20 {
        pipeline
            .producer
            .enqueue("/guilds/1/audit-logs", RequestOptions::get(), None)
            .await
            .unwrap();
    }

    let blocked = loop {
        if let DispatchEvent::InvalidRequestsThreshold { blocked, .. } = events.recv().await.unwrap()
        {
            break blocked;
        }
    };
    assert_eq!(blocked, Duration::from_secs(600));

    sleep(Duration::from_millis(10)).await;
    let until = paused_until(pipeline.consumer.state().await);
    assert!(until >= start + Duration::from_secs(600));
    assert!(pipeline.queue.is_paused().await.unwrap());

    // Nothing else goes out until the block ends.
    let response = pipeline
        .producer
        .fetch("/guilds/1/audit-logs", RequestOptions::get(), None)
        .await
        .unwrap();
    assert_eq!(response.status, 403);
    assert!(transport.sent()[20].at >= start + Duration::from_secs(600));

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_finishes_in_flight_jobs() {
    let transport = Arc::new(ScriptedTransport::new().latency(Duration::from_secs(5)));
    let pipeline = Pipeline::start(transport.clone(), DispatchConfig::default());
    let start = Instant::now();

    let fetch = {
        let producer = pipeline.producer.clone();
        tokio::spawn(async move {
            producer
                .fetch("/users/@me", RequestOptions::get(), None)
                .await
        })
    };
    sleep(Duration::from_secs(1)).await;

    pipeline.shutdown().await;
    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(fetch.await.unwrap().unwrap().status, 200);
}
