//! Anthropic Messages API codec. Differences from the OpenAI dialect:
//! - System messages are a top-level `system` parameter, not part of `messages`.
//! - `max_tokens` is required.
//! - Streaming is typed: `message_start` carries input usage,
//!   `content_block_delta` carries text or tool-input JSON, `message_delta`
//!   carries the stop reason and output usage, `message_stop` ends the message.

use serde_json::{json, Value};

use super::{parse_frame_json, u64_at, CodecSettings, DriverRequest, DriverResponse, TurnRequest};
use crate::pipeline::{SseFrame, StreamParser, UpstreamSignal};
use crate::types::{FinishReason, MessageRole, StreamEvent, ToolCall, ToolCallDelta, Usage};
use crate::Result;

const DEFAULT_MAX_TOKENS: u32 = 4096;
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicCodec {
    settings: CodecSettings,
}

impl AnthropicCodec {
    pub fn new(settings: CodecSettings) -> Self {
        Self { settings }
    }

    /// Split system messages out; Anthropic wants them as a top-level param.
    fn split_system_messages(turn: &TurnRequest) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for m in &turn.messages {
            match m.role {
                MessageRole::System => system_parts.push(&m.content),
                MessageRole::User => messages.push(json!({ "role": "user", "content": m.content })),
                MessageRole::Assistant => {
                    messages.push(json!({ "role": "assistant", "content": m.content }))
                }
                MessageRole::Tool => messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                        "content": m.content,
                    }]
                })),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, messages)
    }

    pub fn build_request(&self, turn: &TurnRequest, stream: bool) -> Result<DriverRequest> {
        let (system, messages) = Self::split_system_messages(turn);
        let mut body = json!({
            "model": self.settings.model_for(turn, "anthropic_codec")?,
            "messages": messages,
            "max_tokens": turn.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        if let Some(t) = turn.temperature {
            body["temperature"] = json!(t);
        }

        let mut headers = self.settings.base_headers();
        headers
            .entry("anthropic-version".to_string())
            .or_insert_with(|| API_VERSION.to_string());
        if let Some(key) = &self.settings.api_key {
            headers.insert("x-api-key".to_string(), key.clone());
        }

        Ok(DriverRequest {
            url: self.settings.endpoint.clone(),
            headers,
            body,
            stream,
        })
    }

    pub fn parse_response(&self, body: &Value) -> Result<DriverResponse> {
        let blocks = body
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in &blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => {}
            }
        }

        let finish_reason = body
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(FinishReason::from_provider)
            .unwrap_or(FinishReason::Stop);

        let usage = body.get("usage").filter(|u| u.is_object()).map(|u| {
            Usage::new(u64_at(u, "/input_tokens"), u64_at(u, "/output_tokens"))
        });

        Ok(DriverResponse {
            content,
            finish_reason,
            usage,
            tool_calls,
            provider_session_id: None,
        })
    }
}

/// Stateful: input token usage arrives in `message_start`, output usage in
/// `message_delta`, and tool blocks are announced before their JSON streams.
#[derive(Debug, Default)]
pub struct AnthropicStreamParser {
    input_tokens: u64,
}

impl StreamParser for AnthropicStreamParser {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<UpstreamSignal>> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let v = parse_frame_json(&frame.data, "anthropic_stream")?;
        let event_type = v
            .get("type")
            .and_then(Value::as_str)
            .or(frame.event.as_deref())
            .unwrap_or("");
        let index = v.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;

        let signals = match event_type {
            "message_start" => {
                self.input_tokens = u64_at(&v, "/message/usage/input_tokens");
                Vec::new()
            }
            "content_block_start" => match v.pointer("/content_block/type").and_then(Value::as_str) {
                Some("tool_use") => vec![UpstreamSignal::Event(StreamEvent::ToolCallDelta(
                    ToolCallDelta {
                        index,
                        id: v.pointer("/content_block/id").and_then(Value::as_str).map(String::from),
                        name: v
                            .pointer("/content_block/name")
                            .and_then(Value::as_str)
                            .map(String::from),
                        arguments: String::new(),
                    },
                ))],
                _ => Vec::new(),
            },
            "content_block_delta" => match v.pointer("/delta/type").and_then(Value::as_str) {
                Some("text_delta") => match v.pointer("/delta/text").and_then(Value::as_str) {
                    Some(text) if !text.is_empty() => {
                        vec![UpstreamSignal::Event(StreamEvent::token(text))]
                    }
                    _ => Vec::new(),
                },
                Some("input_json_delta") => {
                    vec![UpstreamSignal::Event(StreamEvent::ToolCallDelta(ToolCallDelta {
                        index,
                        id: None,
                        name: None,
                        arguments: v
                            .pointer("/delta/partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    }))]
                }
                // thinking and signature deltas are not relayed
                _ => Vec::new(),
            },
            "message_delta" => {
                let mut out = Vec::new();
                if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
                    out.push(UpstreamSignal::Event(StreamEvent::UsageSummary(Usage::new(
                        self.input_tokens,
                        u64_at(usage, "/output_tokens"),
                    ))));
                }
                if let Some(reason) = v.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    out.push(UpstreamSignal::Finish(FinishReason::from_provider(reason)));
                }
                out
            }
            "message_stop" => vec![UpstreamSignal::Terminate],
            "error" => {
                let kind = v.pointer("/error/type").and_then(Value::as_str).unwrap_or("");
                vec![UpstreamSignal::Failure {
                    message: v
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("provider stream error")
                        .to_string(),
                    retryable: matches!(kind, "overloaded_error" | "api_error" | "rate_limit_error"),
                }]
            }
            // ping, content_block_stop
            _ => Vec::new(),
        };
        Ok(signals)
    }
}
