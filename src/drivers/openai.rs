//! OpenAI-compatible chat completions, including FastGPT's variant.
//!
//! FastGPT speaks the same dialect but keeps chat history server-side keyed by
//! `chatId`; the gateway sends the bound provider session (or the conversation
//! id on the first turn) and reports it back so later turns reuse it.

use serde_json::{json, Value};

use super::{parse_frame_json, u64_at, AdapterKind, CodecSettings, DriverRequest, DriverResponse, TurnRequest};
use crate::pipeline::{SseFrame, StreamParser, UpstreamSignal};
use crate::types::{FinishReason, MessageRole, StreamEvent, ToolCall, ToolCallDelta, Usage};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiFlavor {
    OpenAi,
    FastGpt,
}

#[derive(Debug, Clone)]
pub struct OpenAiCodec {
    flavor: OpenAiFlavor,
    settings: CodecSettings,
}

impl OpenAiCodec {
    pub fn new(flavor: OpenAiFlavor, settings: CodecSettings) -> Self {
        Self { flavor, settings }
    }

    pub fn kind(&self) -> AdapterKind {
        match self.flavor {
            OpenAiFlavor::OpenAi => AdapterKind::OpenAi,
            OpenAiFlavor::FastGpt => AdapterKind::FastGpt,
        }
    }

    fn chat_id(&self, turn: &TurnRequest) -> Option<String> {
        match self.flavor {
            OpenAiFlavor::FastGpt => Some(
                turn.provider_session_id
                    .clone()
                    .unwrap_or_else(|| turn.conversation_id.clone()),
            ),
            OpenAiFlavor::OpenAi => None,
        }
    }

    pub fn build_request(&self, turn: &TurnRequest, stream: bool) -> Result<DriverRequest> {
        let messages: Vec<Value> = turn
            .messages
            .iter()
            .map(|m| {
                let mut obj = json!({ "role": m.role.as_str(), "content": m.content });
                // tool_call_id is required on role "tool"
                if m.role == MessageRole::Tool {
                    if let Some(ref id) = m.tool_call_id {
                        obj["tool_call_id"] = Value::String(id.clone());
                    }
                }
                obj
            })
            .collect();

        let mut body = json!({
            "messages": messages,
            "stream": stream,
        });

        match self.flavor {
            OpenAiFlavor::OpenAi => {
                body["model"] = Value::String(self.settings.model_for(turn, "openai_codec")?);
                if stream {
                    body["stream_options"] = json!({ "include_usage": true });
                }
            }
            OpenAiFlavor::FastGpt => {
                if let Some(model) = turn.model.clone().or_else(|| self.settings.model.clone()) {
                    body["model"] = Value::String(model);
                }
                body["detail"] = Value::Bool(false);
                if let Some(chat_id) = self.chat_id(turn) {
                    body["chatId"] = Value::String(chat_id);
                }
            }
        }

        if let Some(t) = turn.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(mt) = turn.max_tokens {
            body["max_tokens"] = json!(mt);
        }

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

    pub fn parse_response(&self, turn: &TurnRequest, body: &Value) -> Result<DriverResponse> {
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish_reason = body
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
            .map(FinishReason::from_provider)
            .unwrap_or(FinishReason::Stop);
        let usage = body.get("usage").filter(|u| u.is_object()).map(parse_usage);
        let tool_calls = body
            .pointer("/choices/0/message/tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .map(|c| {
                        let raw = c
                            .pointer("/function/arguments")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        ToolCall {
                            id: c["id"].as_str().unwrap_or_default().to_string(),
                            name: c
                                .pointer("/function/name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            arguments: serde_json::from_str(raw)
                                .unwrap_or_else(|_| Value::String(raw.to_string())),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(DriverResponse {
            content,
            finish_reason,
            usage,
            tool_calls,
            provider_session_id: self.chat_id(turn),
        })
    }

    pub fn stream_parser(&self, turn: &TurnRequest) -> OpenAiStreamParser {
        OpenAiStreamParser {
            flavor: self.flavor,
            session: self.chat_id(turn),
        }
    }
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

/// Streaming interpreter for `chat.completion.chunk` frames.
#[derive(Debug)]
pub struct OpenAiStreamParser {
    flavor: OpenAiFlavor,
    /// Reported once, with the first frame.
    session: Option<String>,
}

impl StreamParser for OpenAiStreamParser {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<UpstreamSignal>> {
        let mut out = Vec::new();
        if let Some(id) = self.session.take() {
            out.push(UpstreamSignal::ProviderSession(id));
        }

        if frame.is_done_sentinel() {
            out.push(UpstreamSignal::Terminate);
            return Ok(out);
        }

        if self.flavor == OpenAiFlavor::FastGpt {
            match frame.event.as_deref() {
                None | Some("answer") => {}
                Some("error") => {
                    out.push(UpstreamSignal::Failure {
                        message: frame.data.clone(),
                        retryable: false,
                    });
                    return Ok(out);
                }
                // flowNodeStatus, flowResponses and friends
                Some(_) => return Ok(out),
            }
        }

        if frame.data.trim().is_empty() {
            return Ok(out);
        }
        let v = parse_frame_json(&frame.data, "openai_stream")?;

        if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
            let kind = err
                .get("type")
                .or_else(|| err.get("code"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            out.push(UpstreamSignal::Failure {
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("provider stream error")
                    .to_string(),
                retryable: matches!(kind, "server_error" | "overloaded" | "rate_limit_exceeded"),
            });
            return Ok(out);
        }

        if let Some(delta) = v.pointer("/choices/0/delta") {
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(UpstreamSignal::Event(StreamEvent::token(text)));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    out.push(UpstreamSignal::Event(StreamEvent::ToolCallDelta(ToolCallDelta {
                        index: call.get("index").and_then(Value::as_u64).unwrap_or(0) as u32,
                        id: call.get("id").and_then(Value::as_str).map(String::from),
                        name: call
                            .pointer("/function/name")
                            .and_then(Value::as_str)
                            .map(String::from),
                        arguments: call
                            .pointer("/function/arguments")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })));
                }
            }
        }

        if let Some(reason) = v.pointer("/choices/0/finish_reason").and_then(Value::as_str) {
            out.push(UpstreamSignal::Finish(FinishReason::from_provider(reason)));
        }

        if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
            out.push(UpstreamSignal::Event(StreamEvent::UsageSummary(parse_usage(usage))));
        }

        Ok(out)
    }
}
