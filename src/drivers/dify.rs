//! Dify chat-messages API codec.
//!
//! Dify keeps the conversation history itself: each request carries only the
//! newest user query plus the upstream `conversation_id`, which is empty on
//! the first turn and returned by Dify in every answer event.

use serde_json::{json, Value};

use super::{parse_frame_json, u64_at, CodecSettings, DriverRequest, DriverResponse, TurnRequest};
use crate::error::{Error, ErrorContext};
use crate::pipeline::{SseFrame, StreamParser, UpstreamSignal};
use crate::types::{FinishReason, StreamEvent, Usage};
use crate::Result;

#[derive(Debug, Clone)]
pub struct DifyCodec {
    settings: CodecSettings,
}

impl DifyCodec {
    pub fn new(settings: CodecSettings) -> Self {
        Self { settings }
    }

    pub fn build_request(&self, turn: &TurnRequest, stream: bool) -> Result<DriverRequest> {
        let query = turn.last_user_text().ok_or_else(|| {
            Error::validation_with_context(
                "turn has no user message to send",
                ErrorContext::new()
                    .with_field_path("messages")
                    .with_source("dify_codec"),
            )
        })?;

        let body = json!({
            "inputs": {},
            "query": query,
            "response_mode": if stream { "streaming" } else { "blocking" },
            "conversation_id": turn.provider_session_id.clone().unwrap_or_default(),
            "user": turn.user.clone().unwrap_or_else(|| turn.conversation_id.clone()),
        });

        let mut headers = self.settings.base_headers();
        if let Some(key) = &self.settings.api_key {
            headers.insert("authorization".to_string(), format!("Bearer {key}"));
        }

        Ok(DriverRequest {
            url: self.settings.endpoint.clone(),
            headers,
            body,
            stream,
        })
    }

    pub fn parse_response(&self, body: &Value) -> Result<DriverResponse> {
        Ok(DriverResponse {
            content: body["answer"].as_str().unwrap_or_default().to_string(),
            finish_reason: FinishReason::Stop,
            usage: body.pointer("/metadata/usage").filter(|u| u.is_object()).map(parse_usage),
            tool_calls: Vec::new(),
            provider_session_id: conversation_id(body),
        })
    }
}

fn conversation_id(v: &Value) -> Option<String> {
    v.get("conversation_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn parse_usage(u: &Value) -> Usage {
    let prompt = u64_at(u, "/prompt_tokens");
    let completion = u64_at(u, "/completion_tokens");
    let total = u64_at(u, "/total_tokens");
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: if total > 0 { total } else { prompt + completion },
    }
}

/// Dify's event kind lives in the JSON payload, not the SSE `event:` field.
#[derive(Debug, Default)]
pub struct DifyStreamParser {
    session_reported: bool,
}

impl StreamParser for DifyStreamParser {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<UpstreamSignal>> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let v = parse_frame_json(&frame.data, "dify_stream")?;
        let mut out = Vec::new();

        if !self.session_reported {
            if let Some(id) = conversation_id(&v) {
                self.session_reported = true;
                out.push(UpstreamSignal::ProviderSession(id));
            }
        }

        match v.get("event").and_then(Value::as_str).unwrap_or("") {
            "message" | "agent_message" => {
                if let Some(text) = v.get("answer").and_then(Value::as_str) {
                    if !text.is_empty() {
                        out.push(UpstreamSignal::Event(StreamEvent::token(text)));
                    }
                }
            }
            "message_end" => {
                if let Some(usage) = v.pointer("/metadata/usage").filter(|u| u.is_object()) {
                    out.push(UpstreamSignal::Event(StreamEvent::UsageSummary(parse_usage(usage))));
                }
                out.push(UpstreamSignal::Finish(FinishReason::Stop));
                out.push(UpstreamSignal::Terminate);
            }
            "error" => {
                let status = v.get("status").and_then(Value::as_u64).unwrap_or(500);
                out.push(UpstreamSignal::Failure {
                    message: v
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("provider stream error")
                        .to_string(),
                    retryable: status >= 500 || status == 429,
                });
            }
            // ping, workflow_*, node_*, message_file, tts_message, ...
            _ => {}
        }
        Ok(out)
    }
}
