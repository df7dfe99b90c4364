mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{MODEL, RecordingSink, Reply, ScriptedUpstream, channel, chat_request, config, tenant};
use conduit_gateway::gateway::{
    Gateway, GatewayConfig, GatewayError, ManualClock, ModelConfig, Outcome, RetryPolicy,
    SeededRandom, UpstreamError, UpstreamErrorKind,
};

async fn build(
    config: GatewayConfig,
    upstream: Arc<ScriptedUpstream>,
    sink: Arc<RecordingSink>,
) -> conduit_gateway::Result<Gateway> {
    Gateway::builder(config)
        .upstream(upstream)
        .usage_sink(sink)
        .random(Arc::new(SeededRandom::new(3)))
        .clock(Arc::new(ManualClock::new(1_000)))
        .build()
        .await
}

#[tokio::test(start_paused = true)]
async fn timed_out_channel_fails_over_within_its_deadline() -> conduit_gateway::Result<()> {
    let mut slow = channel("a").with_weight(1_000);
    slow.timeout_seconds = Some(2);
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.push("a", Reply::Delay(Duration::from_secs(30)));
    let sink = Arc::new(RecordingSink::default());
    let gateway = build(
        config(
            tenant("acme", 1_000_000),
            ModelConfig::new(MODEL),
            vec![slow, channel("b")],
        ),
        upstream.clone(),
        sink.clone(),
    )
    .await?;

    let mut failed_over = None;
    for _ in 0..20 {
        let started = tokio::time::Instant::now();
        let response = gateway.handle(chat_request("sk-acme")).await.unwrap();
        if response.attempts == 2 {
            failed_over = Some((response, started.elapsed()));
            break;
        }
    }
    let (response, elapsed) = failed_over.expect("the slow channel was never selected");
    assert_eq!(response.status, 200);
    assert_eq!(response.channel_id.as_deref(), Some("b"));
    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");

    assert!(gateway.accountant().flush(Duration::from_secs(5)).await);
    let event = sink
        .events()
        .into_iter()
        .find(|event| event.request_id == response.request_id)
        .unwrap();
    assert_eq!(event.outcome, Outcome::Success);
    assert_eq!(event.channel_id.as_deref(), Some("b"));
    assert_eq!(event.attempts, 2);

    gateway.health().refresh();
    let health = gateway.health().snapshot();
    assert!(health.error_rate("a") > 0.0);
    Ok(())
}

#[tokio::test]
async fn every_attempt_replays_the_same_bytes() -> conduit_gateway::Result<()> {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.push(
        "a",
        Reply::Fail(UpstreamError::from_status(503, Bytes::from_static(b"busy"))),
    );
    upstream.push("b", Reply::Fail(UpstreamError::connection("reset")));
    let sink = Arc::new(RecordingSink::default());
    let gateway = build(
        config(
            tenant("acme", 1_000_000),
            ModelConfig::new(MODEL),
            vec![
                channel("a").with_weight(1_000),
                channel("b").with_weight(1_000),
                channel("c"),
            ],
        ),
        upstream.clone(),
        sink,
    )
    .await?;

    let request = chat_request("sk-acme");
    let sent = request.body.clone();
    gateway.handle(request).await.unwrap();

    let calls = upstream.calls();
    assert!(calls.len() >= 2);
    for (_, body) in &calls {
        assert_eq!(body, &sent);
    }
    let mut channels: Vec<_> = calls.iter().map(|(id, _)| id.clone()).collect();
    channels.sort();
    channels.dedup();
    assert_eq!(channels.len(), calls.len(), "no channel is tried twice");
    Ok(())
}

#[tokio::test]
async fn attempts_never_exceed_the_retry_budget() -> conduit_gateway::Result<()> {
    let upstream = Arc::new(ScriptedUpstream::default());
    for id in ["a", "b", "c", "d"] {
        upstream.push(
            id,
            Reply::Fail(UpstreamError::from_status(502, Bytes::from_static(b"bad gateway"))),
        );
    }
    let sink = Arc::new(RecordingSink::default());
    let mut gateway_config = config(
        tenant("acme", 1_000_000),
        ModelConfig::new(MODEL),
        vec![channel("a"), channel("b"), channel("c"), channel("d")],
    );
    gateway_config.retry = RetryPolicy {
        max_retries: 1,
        ..RetryPolicy::default()
    };
    let gateway = build(gateway_config, upstream.clone(), sink.clone()).await?;

    let err = gateway.handle(chat_request("sk-acme")).await.unwrap_err();
    let upstream_err = match &err {
        GatewayError::Upstream(upstream_err) => upstream_err,
        other => panic!("expected an upstream error, got {other:?}"),
    };
    assert_eq!(upstream_err.kind, UpstreamErrorKind::Provider5xx);
    assert_eq!(upstream.calls().len(), 2);

    assert!(gateway.accountant().flush(Duration::from_secs(5)).await);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].attempts, 2);
    assert_eq!(
        events[0].outcome,
        Outcome::UpstreamFailure {
            kind: "upstream_error".to_string(),
            status: Some(502),
        }
    );
    assert_eq!(
        events[0].channel_id.as_deref(),
        upstream.calls().last().map(|(id, _)| id.as_str())
    );
    assert!(sink.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn same_channel_retry_needs_policy_consent() -> conduit_gateway::Result<()> {
    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.push("a", Reply::Fail(UpstreamError::connection("reset")));
    let mut model = ModelConfig::new(MODEL);
    model.retry = Some(RetryPolicy {
        max_retries: 2,
        allow_same_channel: true,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
    });
    let gateway = build(
        config(tenant("acme", 1_000_000), model, vec![channel("a")]),
        upstream.clone(),
        Arc::new(RecordingSink::default()),
    )
    .await?;

    let response = gateway.handle(chat_request("sk-acme")).await.unwrap();
    assert_eq!(response.attempts, 2);
    assert_eq!(upstream.calls_to("a"), 2);

    let upstream = Arc::new(ScriptedUpstream::default());
    upstream.push("a", Reply::Fail(UpstreamError::connection("reset")));
    let gateway = build(
        config(
            tenant("acme", 1_000_000),
            ModelConfig::new(MODEL),
            vec![channel("a")],
        ),
        upstream.clone(),
        Arc::new(RecordingSink::default()),
    )
    .await?;
    let err = gateway.handle(chat_request("sk-acme")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Upstream(_)));
    assert_eq!(upstream.calls_to("a"), 1);
    Ok(())
}
