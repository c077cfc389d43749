//! Rate limiting, circuit breaking and retry as seen through the gateway.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ai_lib_gateway::resilience::{
    BreakerState, ProtectionService, ProtectionTarget, RateLimiter,
};
use ai_lib_gateway::telemetry::{ObservedEvent, RecordingObserver};
use ai_lib_gateway::{
    ChannelSink, ChatTurnRequest, Error, FinalOutcome, Gateway, Message, Rejection, StreamEvent,
};
use common::{bad_request, drain, ok_stream, provider, reset, Attempt, Chunk, ScriptedAdapter};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn turn(conversation: &str, caller: &str) -> ChatTurnRequest {
    ChatTurnRequest::new(conversation, caller, "scripted", vec![Message::user("hello")])
}

#[tokio::test]
async fn test_breaker_opens_after_threshold_without_network_attempt() {
    let adapter = ScriptedAdapter::with_fallback(vec![], Attempt::Fail(reset));
    let observer = RecordingObserver::new();
    let mut p = provider("scripted");
    p.breaker_threshold = 5;
    p.breaker_cooldown_ms = 60_000;
    p.retry.max_attempts = 1;
    let gw = Gateway::builder()
        .provider_with_adapter(p, adapter.clone())
        .observer(Arc::new(observer.clone()))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    for i in 0..5 {
        let outcome = gw.chat(turn(&format!("c{i}"), "u1"), &cancel).await;
        assert!(
            matches!(outcome, FinalOutcome::Failed(Error::UpstreamConnection { .. })),
            "attempt {i}: {outcome:?}"
        );
    }
    assert_eq!(adapter.attempts(), 5);

    let outcome = gw.chat(turn("c5", "u1"), &cancel).await;
    match outcome {
        FinalOutcome::Rejected(Rejection::Unavailable {
            identity,
            retry_after_ms,
        }) => {
            assert_eq!(identity.as_str(), "scripted");
            assert!(retry_after_ms.unwrap_or(0) > 0);
        }
        other => panic!("expected Unavailable, got {other:?}"),
    }
    assert_eq!(adapter.attempts(), 5, "an open breaker must not reach the network");

    let opened = observer.events().into_iter().any(|e| {
        matches!(e, ObservedEvent::Transition(_, t) if t.to == BreakerState::Open)
    });
    assert!(opened);
    let snap = gw.signals(Some("scripted"), None).breaker.unwrap();
    assert_eq!(snap.state, BreakerState::Open);
}

#[tokio::test]
async fn test_breaker_opens_after_five_failed_calls_with_default_retries() {
    let adapter = ScriptedAdapter::with_fallback(vec![], Attempt::Fail(reset));
    let mut p = provider("scripted");
    p.breaker_threshold = 5;
    p.breaker_cooldown_ms = 60_000;
    p.retry.max_attempts = 3;
    let gw = Gateway::builder()
        .provider_with_adapter(p, adapter.clone())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    for i in 0..5 {
        let outcome = gw.chat(turn(&format!("c{i}"), "u1"), &cancel).await;
        assert!(
            matches!(outcome, FinalOutcome::Failed(Error::UpstreamConnection { .. })),
            "call {i}: {outcome:?}"
        );
    }
    assert_eq!(adapter.attempts(), 15);

    let outcome = gw.chat(turn("c5", "u1"), &cancel).await;
    assert!(matches!(
        outcome,
        FinalOutcome::Rejected(Rejection::Unavailable { .. })
    ));
    assert_eq!(adapter.attempts(), 15);
    let snap = gw.signals(Some("scripted"), None).breaker.unwrap();
    assert_eq!(snap.state, BreakerState::Open);
}

#[tokio::test]
async fn test_repeated_mid_stream_drops_open_the_breaker() {
    let adapter = ScriptedAdapter::with_fallback(
        vec![],
        Attempt::Stream(vec![Chunk::Token("partial"), Chunk::Reset]),
    );
    let mut p = provider("scripted");
    p.breaker_threshold = 2;
    p.breaker_cooldown_ms = 60_000;
    let gw = Gateway::builder()
        .provider_with_adapter(p, adapter.clone())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    for i in 0..2 {
        let outcome = gw.chat(turn(&format!("c{i}"), "u1"), &cancel).await;
        assert!(
            matches!(outcome, FinalOutcome::Interrupted { .. }),
            "turn {i}: {outcome:?}"
        );
    }
    let snap = gw.signals(Some("scripted"), None).breaker.unwrap();
    assert_eq!(snap.state, BreakerState::Open);

    for i in 2..6 {
        let outcome = gw.chat(turn(&format!("c{i}"), "u1"), &cancel).await;
        assert!(matches!(
            outcome,
            FinalOutcome::Rejected(Rejection::Unavailable { .. })
        ));
    }
    assert_eq!(adapter.attempts(), 2);
}

#[tokio::test]
async fn test_half_open_probe_stays_open_until_the_stream_finishes() {
    let gate = Arc::new(Notify::new());
    let adapter = ScriptedAdapter::new(vec![
        Attempt::Fail(reset),
        Attempt::Stream(vec![
            Chunk::Token("probe"),
            Chunk::Hold(gate.clone()),
            Chunk::Finish(ai_lib_gateway::FinishReason::Stop),
        ]),
    ]);
    let mut p = provider("scripted");
    p.breaker_threshold = 1;
    p.breaker_cooldown_ms = 30;
    p.retry.max_attempts = 1;
    let gw = Gateway::builder()
        .provider_with_adapter(p, adapter.clone())
        .build()
        .unwrap();

    assert!(matches!(
        gw.chat(turn("c1", "u1"), &CancellationToken::new()).await,
        FinalOutcome::Failed(_)
    ));
    tokio::time::sleep(Duration::from_millis(60)).await;

    let (mut rx, probe) = gw.spawn_turn(turn("c2", "u1"), CancellationToken::new(), 4);
    assert_eq!(rx.recv().await, Some(StreamEvent::token("probe")));
    // the stream is open, but the provider has not proven itself yet
    let snap = gw.signals(Some("scripted"), None).breaker.unwrap();
    assert_eq!(snap.state, BreakerState::HalfOpen);
    assert!(snap.half_open_probe_in_flight);

    gate.notify_one();
    assert!(probe.await.unwrap().is_completed());
    let snap = gw.signals(Some("scripted"), None).breaker.unwrap();
    assert_eq!(snap.state, BreakerState::Closed);
}

#[tokio::test]
async fn test_rate_limit_rejects_the_101st_request() {
    let service = ProtectionService::default();
    let mut p = provider("scripted");
    p.rate_limit.window_ms = 60_000;
    p.rate_limit.max = 100;
    let target = ProtectionTarget {
        identity: p.identity.clone(),
        caller_key: "caller-a".into(),
        policy: p.policy(),
    };
    let cancel = CancellationToken::new();

    for _ in 0..100 {
        let r: ai_lib_gateway::Result<u32> = service.execute(&target, &cancel, |_| async { Ok(1) }).await;
        assert!(r.is_ok());
    }
    let r: ai_lib_gateway::Result<u32> = service.execute(&target, &cancel, |_| async { Ok(1) }).await;
    match r {
        Err(Error::RateLimited {
            caller_key,
            retry_after_ms,
        }) => {
            assert_eq!(caller_key, "caller-a");
            assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // a different caller has its own window
    let other = ProtectionTarget {
        caller_key: "caller-b".into(),
        ..target.clone()
    };
    let r: ai_lib_gateway::Result<u32> = service.execute(&other, &cancel, |_| async { Ok(1) }).await;
    assert!(r.is_ok());
}

#[tokio::test]
async fn test_rate_limited_caller_never_touches_breaker_or_network() {
    let adapter = ScriptedAdapter::new(vec![]);
    let mut p = provider("scripted");
    p.rate_limit.max = 1;
    let limiter = Arc::new(RateLimiter::new());
    let gw = Gateway::builder()
        .provider_with_adapter(p, adapter.clone())
        .rate_limiter(limiter.clone())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(gw.chat(turn("c1", "u1"), &cancel).await.is_completed());
    let (sink, mut rx) = ChannelSink::channel(8);
    let outcome = gw.handle(turn("c2", "u1"), &sink, &cancel).await;
    drop(sink);
    assert!(matches!(
        outcome,
        FinalOutcome::Rejected(Rejection::RateLimited { .. })
    ));
    assert_eq!(adapter.attempts(), 1);

    let events = drain(&mut rx, Duration::from_secs(1)).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::Error { retryable: true, .. }));
    assert_eq!(limiter.snapshot("u1").unwrap().count, 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried_invisibly() {
    let adapter = ScriptedAdapter::new(vec![Attempt::Fail(reset), ok_stream(&["Hi", " there"])]);
    let observer = RecordingObserver::new();
    let mut p = provider("scripted");
    p.retry.max_attempts = 3;
    let gw = Gateway::builder()
        .provider_with_adapter(p, adapter.clone())
        .observer(Arc::new(observer.clone()))
        .build()
        .unwrap();

    let (sink, mut rx) = ChannelSink::channel(16);
    let outcome = gw
        .handle(turn("c1", "u1"), &sink, &CancellationToken::new())
        .await;
    drop(sink);

    let message = match outcome {
        FinalOutcome::Completed(m) => m,
        other => panic!("expected Completed, got {other:?}"),
    };
    assert_eq!(message.content, "Hi there");
    assert_eq!(adapter.attempts(), 2);

    let events = drain(&mut rx, Duration::from_secs(1)).await;
    assert!(events.iter().all(|e| !matches!(e, StreamEvent::Error { .. })));
    assert_eq!(events.last(), Some(&StreamEvent::done(ai_lib_gateway::FinishReason::Stop)));

    let retries = observer.retries();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].attempt_number, 1);
    assert!(retries[0].delay_ms <= 5);
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts_with_last_error() {
    let adapter = ScriptedAdapter::with_fallback(vec![], Attempt::Fail(reset));
    let mut p = provider("scripted");
    p.retry.max_attempts = 3;
    let gw = Gateway::builder()
        .provider_with_adapter(p, adapter.clone())
        .build()
        .unwrap();

    let outcome = gw.chat(turn("c1", "u1"), &CancellationToken::new()).await;
    assert!(matches!(
        outcome,
        FinalOutcome::Failed(Error::UpstreamConnection { .. })
    ));
    assert_eq!(adapter.attempts(), 3);
    // the call failed once, however many attempts it took
    let snap = gw.signals(Some("scripted"), None).breaker.unwrap();
    assert_eq!(snap.consecutive_failures, 1);
}

#[tokio::test]
async fn test_rejected_request_is_never_retried() {
    let adapter = ScriptedAdapter::with_fallback(vec![], Attempt::Fail(bad_request));
    let mut p = provider("scripted");
    p.retry.max_attempts = 5;
    let gw = Gateway::builder()
        .provider_with_adapter(p, adapter.clone())
        .build()
        .unwrap();

    let outcome = gw.chat(turn("c1", "u1"), &CancellationToken::new()).await;
    assert!(matches!(
        outcome,
        FinalOutcome::Failed(Error::UpstreamRejected { status: 400, .. })
    ));
    assert_eq!(adapter.attempts(), 1);
}

#[tokio::test]
async fn test_half_open_probe_closes_breaker_after_cooldown() {
    let adapter = ScriptedAdapter::new(vec![Attempt::Fail(reset)]);
    let mut p = provider("scripted");
    p.breaker_threshold = 1;
    p.breaker_cooldown_ms = 50;
    p.retry.max_attempts = 1;
    let gw = Gateway::builder()
        .provider_with_adapter(p, adapter.clone())
        .build()
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(matches!(
        gw.chat(turn("c1", "u1"), &cancel).await,
        FinalOutcome::Failed(_)
    ));
    assert!(matches!(
        gw.chat(turn("c1", "u1"), &cancel).await,
        FinalOutcome::Rejected(Rejection::Unavailable { .. })
    ));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(gw.chat(turn("c1", "u1"), &cancel).await.is_completed());
    assert_eq!(adapter.attempts(), 2);
    let snap = gw.signals(Some("scripted"), None).breaker.unwrap();
    assert_eq!(snap.state, BreakerState::Closed);
    assert_eq!(snap.consecutive_failures, 0);
}
