//! Wire-level adapter behaviour against a mock HTTP server.

mod common;

use std::time::Duration;

use ai_lib_gateway::config::{Credentials, ProviderConfig};
use ai_lib_gateway::drivers::AdapterKind;
use ai_lib_gateway::{
    ChannelSink, ChatTurnRequest, Error, FinalOutcome, FinishReason, Gateway, Message, StreamEvent,
};
use common::{drain, MockServerFixture};
use mockito::Matcher;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn wire_provider(identity: &str, adapter: AdapterKind, endpoint: String) -> ProviderConfig {
    let mut p = ProviderConfig::new(identity, adapter, endpoint);
    p.credentials = Credentials::inline("sk-test");
    p.model = Some("test-model".into());
    p.retry.base_delay_ms = 1;
    p.retry.cap_ms = 5;
    p
}

fn turn(conversation: &str, provider: &str, text: &str) -> ChatTurnRequest {
    ChatTurnRequest::new(conversation, "u1", provider, vec![Message::user(text)])
}

async fn run(gw: &Gateway, request: ChatTurnRequest) -> (FinalOutcome, Vec<StreamEvent>) {
    let (sink, mut rx) = ChannelSink::channel(64);
    let outcome = gw.handle(request, &sink, &CancellationToken::new()).await;
    drop(sink);
    let events = drain(&mut rx, Duration::from_secs(2)).await;
    (outcome, events)
}

fn tokens(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TokenDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

const OPENAI_FRAMES: &[&str] = &[
    r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
    r#"{"choices":[{"index":0,"delta":{"content":"Hello"}}]}"#,
    r#"{"choices":[{"index":0,"delta":{"content":" world"}}]}"#,
    r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
    r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
    "[DONE]",
];

#[tokio::test]
async fn test_openai_stream_through_gateway() {
    let mut fixture = MockServerFixture::new().await;
    let body = OPENAI_FRAMES
        .iter()
        .map(|f| format!("data: {f}\n\n"))
        .collect::<String>();
    let mock = fixture
        .server
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "model": "test-model",
            "stream": true,
            "stream_options": { "include_usage": true },
        })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .expect(1)
        .create_async()
        .await;

    let gw = Gateway::builder()
        .provider(wire_provider(
            "openai",
            AdapterKind::OpenAi,
            fixture.url("/v1/chat/completions"),
        ))
        .build()
        .unwrap();

    let (outcome, events) = run(&gw, turn("c1", "openai", "Hi")).await;
    mock.assert_async().await;

    assert_eq!(tokens(&events), "Hello world");
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::UsageSummary(u) if u.total_tokens == 7
    )));
    assert_eq!(events.last(), Some(&StreamEvent::done(FinishReason::Stop)));

    let message = match outcome {
        FinalOutcome::Completed(m) => m,
        other => panic!("expected Completed, got {other:?}"),
    };
    assert_eq!(message.content, "Hello world");
    assert_eq!(message.usage.unwrap().prompt_tokens, 5);
}

#[tokio::test]
async fn test_anthropic_stream_through_gateway() {
    let mut fixture = MockServerFixture::new().await;
    let frames = [
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12}}}",
        "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}",
        "event: ping\ndata: {\"type\":\"ping\"}",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Bonjour\"}}",
        "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}",
        "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\"},\"usage\":{\"output_tokens\":3}}",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}",
    ];
    let mock = fixture.mock_sse("/v1/messages", &frames).await;

    let gw = Gateway::builder()
        .provider(wire_provider(
            "claude",
            AdapterKind::Anthropic,
            fixture.url("/v1/messages"),
        ))
        .build()
        .unwrap();

    let (outcome, events) = run(&gw, turn("c1", "claude", "Hi")).await;
    mock.assert_async().await;

    assert_eq!(tokens(&events), "Bonjour");
    assert_eq!(events.last(), Some(&StreamEvent::done(FinishReason::Length)));
    let message = outcome.message().cloned().unwrap();
    assert_eq!(message.finish_reason, FinishReason::Length);
    let usage = message.usage.unwrap();
    assert_eq!((usage.prompt_tokens, usage.completion_tokens), (12, 3));
}

#[tokio::test]
async fn test_dify_conversation_id_is_reused_on_the_next_turn() {
    let mut fixture = MockServerFixture::new().await;
    let first = fixture
        .server
        .mock("POST", "/v1/chat-messages")
        .match_body(Matcher::PartialJson(json!({
            "query": "first question",
            "conversation_id": "",
            "response_mode": "streaming",
        })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(concat!(
            "data: {\"event\":\"message\",\"conversation_id\":\"dify-conv-1\",\"answer\":\"one\"}\n\n",
            "data: {\"event\":\"message_end\",\"conversation_id\":\"dify-conv-1\",\"metadata\":{\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":1}}}\n\n",
        ))
        .expect(1)
        .create_async()
        .await;
    let second = fixture
        .server
        .mock("POST", "/v1/chat-messages")
        .match_body(Matcher::PartialJson(json!({
            "query": "second question",
            "conversation_id": "dify-conv-1",
        })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(concat!(
            "data: {\"event\":\"message\",\"conversation_id\":\"dify-conv-1\",\"answer\":\"two\"}\n\n",
            "data: {\"event\":\"message_end\",\"conversation_id\":\"dify-conv-1\"}\n\n",
        ))
        .expect(1)
        .create_async()
        .await;

    let gw = Gateway::builder()
        .provider(wire_provider(
            "dify",
            AdapterKind::Dify,
            fixture.url("/v1/chat-messages"),
        ))
        .build()
        .unwrap();

    let (outcome, _) = run(&gw, turn("c1", "dify", "first question")).await;
    let message = outcome.message().cloned().unwrap();
    assert_eq!(message.content, "one");
    assert_eq!(message.provider_session_id.as_deref(), Some("dify-conv-1"));
    assert_eq!(message.usage.unwrap().total_tokens, 5);

    let (outcome, _) = run(&gw, turn("c1", "dify", "second question")).await;
    assert_eq!(outcome.message().unwrap().content, "two");

    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn test_non_streaming_json_response() {
    let mut fixture = MockServerFixture::new().await;
    let mock = fixture
        .server
        .mock("POST", "/v1/chat/completions")
        .match_body(Matcher::PartialJson(json!({ "stream": false })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "all at once" },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 3, "total_tokens": 6 }
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let gw = Gateway::builder()
        .provider(wire_provider(
            "openai",
            AdapterKind::OpenAi,
            fixture.url("/v1/chat/completions"),
        ))
        .build()
        .unwrap();

    let (outcome, events) = run(&gw, turn("c1", "openai", "Hi").streaming(false)).await;
    mock.assert_async().await;

    assert_eq!(outcome.message().unwrap().content, "all at once");
    assert_eq!(events.first(), Some(&StreamEvent::token("all at once")));
    assert_eq!(events.last(), Some(&StreamEvent::done(FinishReason::Stop)));
}

#[tokio::test]
async fn test_client_error_status_is_not_retried() {
    let mut fixture = MockServerFixture::new().await;
    let mock = fixture
        .server
        .mock("POST", "/v1/chat/completions")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":{"message":"model not found","type":"invalid_request_error"}}"#)
        .expect(1)
        .create_async()
        .await;

    let mut p = wire_provider(
        "openai",
        AdapterKind::OpenAi,
        fixture.url("/v1/chat/completions"),
    );
    p.retry.max_attempts = 4;
    let gw = Gateway::builder().provider(p).build().unwrap();

    let (outcome, events) = run(&gw, turn("c1", "openai", "Hi")).await;
    mock.assert_async().await;

    assert!(matches!(
        outcome,
        FinalOutcome::Failed(Error::UpstreamRejected { status: 400, .. })
    ));
    assert!(matches!(
        events.as_slice(),
        [StreamEvent::Error { retryable: false, .. }, ..]
    ));
    let snap = gw.signals(Some("openai"), None).breaker.unwrap();
    assert_eq!(snap.consecutive_failures, 1);
}

#[tokio::test]
async fn test_server_error_is_retried_until_success() {
    let mut fixture = MockServerFixture::new().await;
    let unavailable = fixture
        .server
        .mock("POST", "/v1/chat/completions")
        .with_status(503)
        .with_body("upstream overloaded")
        .expect(1)
        .create_async()
        .await;
    let ok = fixture
        .server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(
            OPENAI_FRAMES
                .iter()
                .map(|f| format!("data: {f}\n\n"))
                .collect::<String>(),
        )
        .expect(1)
        .create_async()
        .await;

    let mut p = wire_provider(
        "openai",
        AdapterKind::OpenAi,
        fixture.url("/v1/chat/completions"),
    );
    p.retry.max_attempts = 3;
    let gw = Gateway::builder().provider(p).build().unwrap();

    let (outcome, events) = run(&gw, turn("c1", "openai", "Hi")).await;
    unavailable.assert_async().await;
    ok.assert_async().await;

    assert!(outcome.is_completed(), "{outcome:?}");
    assert!(events.iter().all(|e| !matches!(e, StreamEvent::Error { .. })));
    assert_eq!(tokens(&events), "Hello world");
}

#[tokio::test]
async fn test_fastgpt_sends_chat_id() {
    let mut fixture = MockServerFixture::new().await;
    let mock = fixture
        .server
        .mock("POST", "/api/v1/chat/completions")
        .match_body(Matcher::PartialJson(json!({ "chatId": "conv-7", "detail": false })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(concat!(
            "event: answer\ndata: {\"choices\":[{\"delta\":{\"content\":\"fast\"}}]}\n\n",
            "event: flowNodeStatus\ndata: {\"status\":\"running\"}\n\n",
            "event: answer\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "event: answer\ndata: [DONE]\n\n",
        ))
        .expect(1)
        .create_async()
        .await;

    let gw = Gateway::builder()
        .provider(wire_provider(
            "fastgpt",
            AdapterKind::FastGpt,
            fixture.url("/api/v1/chat/completions"),
        ))
        .build()
        .unwrap();

    let (outcome, events) = run(&gw, turn("conv-7", "fastgpt", "Hi")).await;
    mock.assert_async().await;

    assert_eq!(tokens(&events), "fast");
    let message = outcome.message().cloned().unwrap();
    assert_eq!(message.provider_session_id.as_deref(), Some("conv-7"));
}
