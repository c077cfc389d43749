//! Provider 适配层 — 把各厂商的请求/响应/流式协议统一为同一种形状
//!
//! Provider adapter layer. Every backend speaks its own request, response and
//! streaming dialect; a [`Codec`] translates one dialect and [`HttpAdapter`]
//! drives it over HTTP. The set of dialects is closed: adding a provider means
//! adding one [`AdapterKind`] variant and its codec, nothing upstream changes.

pub mod anthropic;
pub mod dify;
pub mod openai;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorContext};
use crate::pipeline::{event_stream, EventStream, StreamParser};
use crate::transport::HttpTransport;
use crate::types::{FinishReason, Message, ToolCall, Usage};
use crate::Result;

pub use anthropic::AnthropicCodec;
pub use dify::DifyCodec;
pub use openai::{OpenAiCodec, OpenAiFlavor};

/// Wire dialects the gateway can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// OpenAI-compatible chat completions.
    #[serde(rename = "openai")]
    OpenAi,
    /// FastGPT's OpenAI-compatible endpoint with server-side chat history.
    #[serde(rename = "fastgpt")]
    FastGpt,
    /// Anthropic Messages API.
    Anthropic,
    /// Dify chat-messages API.
    Dify,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::OpenAi => "openai",
            AdapterKind::FastGpt => "fastgpt",
            AdapterKind::Anthropic => "anthropic",
            AdapterKind::Dify => "dify",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(AdapterKind::OpenAi),
            "fastgpt" => Ok(AdapterKind::FastGpt),
            "anthropic" => Ok(AdapterKind::Anthropic),
            "dify" => Ok(AdapterKind::Dify),
            other => Err(Error::configuration_with_context(
                format!("unknown adapter '{other}'"),
                ErrorContext::new()
                    .with_field_path("adapter")
                    .with_details("expected one of: openai, fastgpt, anthropic, dify"),
            )),
        }
    }
}

/// One chat turn as handed to an adapter.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    /// Caller identity forwarded to providers that track end users.
    pub user: Option<String>,
    pub model: Option<String>,
    /// Provider-side session bound by a previous turn.
    pub provider_session_id: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl TurnRequest {
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Unified HTTP request representation for provider communication.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    /// Full endpoint URL.
    pub url: String,
    /// Request headers, auth included.
    pub headers: HashMap<String, String>,
    /// Serialized JSON request body.
    pub body: Value,
    /// Whether streaming is requested.
    pub stream: bool,
}

/// Unified non-streaming chat response.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
    pub provider_session_id: Option<String>,
}

/// Endpoint and credentials a codec needs to build requests.
#[derive(Debug, Clone, Default)]
pub struct CodecSettings {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub headers: HashMap<String, String>,
}

impl CodecSettings {
    fn base_headers(&self) -> HashMap<String, String> {
        let mut headers = self.headers.clone();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers
    }

    fn model_for(&self, turn: &TurnRequest, source: &str) -> Result<String> {
        turn.model
            .clone()
            .or_else(|| self.model.clone())
            .ok_or_else(|| {
                Error::validation_with_context(
                    "no model configured for this provider",
                    ErrorContext::new()
                        .with_field_path("model")
                        .with_source(source.to_string()),
                )
            })
    }
}

/// Closed set of wire dialects.
#[derive(Debug, Clone)]
pub enum Codec {
    OpenAi(OpenAiCodec),
    Anthropic(AnthropicCodec),
    Dify(DifyCodec),
}

impl Codec {
    pub fn new(kind: AdapterKind, settings: CodecSettings) -> Self {
        match kind {
            AdapterKind::OpenAi => Codec::OpenAi(OpenAiCodec::new(OpenAiFlavor::OpenAi, settings)),
            AdapterKind::FastGpt => {
                Codec::OpenAi(OpenAiCodec::new(OpenAiFlavor::FastGpt, settings))
            }
            AdapterKind::Anthropic => Codec::Anthropic(AnthropicCodec::new(settings)),
            AdapterKind::Dify => Codec::Dify(DifyCodec::new(settings)),
        }
    }

    pub fn kind(&self) -> AdapterKind {
        match self {
            Codec::OpenAi(c) => c.kind(),
            Codec::Anthropic(_) => AdapterKind::Anthropic,
            Codec::Dify(_) => AdapterKind::Dify,
        }
    }

    pub fn build_request(&self, turn: &TurnRequest, stream: bool) -> Result<DriverRequest> {
        match self {
            Codec::OpenAi(c) => c.build_request(turn, stream),
            Codec::Anthropic(c) => c.build_request(turn, stream),
            Codec::Dify(c) => c.build_request(turn, stream),
        }
    }

    pub fn parse_response(&self, turn: &TurnRequest, body: &Value) -> Result<DriverResponse> {
        match self {
            Codec::OpenAi(c) => c.parse_response(turn, body),
            Codec::Anthropic(c) => c.parse_response(body),
            Codec::Dify(c) => c.parse_response(body),
        }
    }

    pub fn stream_parser(&self, turn: &TurnRequest) -> Box<dyn StreamParser> {
        match self {
            Codec::OpenAi(c) => Box::new(c.stream_parser(turn)),
            Codec::Anthropic(_) => Box::new(anthropic::AnthropicStreamParser::default()),
            Codec::Dify(_) => Box::new(dify::DifyStreamParser::default()),
        }
    }
}

/// Core trait for provider-specific API adaptation.
///
/// Adapters are resolved once per request from the provider registry and are
/// shared across concurrent turns. Cancelling `cancel` must abort the network
/// call promptly; dropping a returned stream releases its connection.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + fmt::Debug {
    fn kind(&self) -> AdapterKind;

    /// Run one non-streaming turn.
    async fn complete(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<DriverResponse>;

    /// Open a streaming turn. Resolves once the provider accepted the request;
    /// failures before that point are returned here, later ones inside the
    /// stream.
    async fn open_stream(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream>;
}

/// Adapter for every HTTP+JSON provider: a codec plus a transport.
#[derive(Debug)]
pub struct HttpAdapter {
    codec: Codec,
    transport: HttpTransport,
    idle_timeout: Option<Duration>,
}

impl HttpAdapter {
    pub fn new(codec: Codec, transport: HttpTransport, idle_timeout: Option<Duration>) -> Self {
        Self {
            codec,
            transport,
            idle_timeout,
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    fn kind(&self) -> AdapterKind {
        self.codec.kind()
    }

    async fn complete(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<DriverResponse> {
        let req = self.codec.build_request(request, false)?;
        let body = self.transport.send_json(&req, cancel).await?;
        self.codec.parse_response(request, &body)
    }

    async fn open_stream(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream> {
        let req = self.codec.build_request(request, true)?;
        let resp = self.transport.send(&req, cancel).await?;
        Ok(event_stream(
            HttpTransport::byte_stream(resp),
            self.codec.stream_parser(request),
            self.idle_timeout,
        ))
    }
}

/// Parse one frame payload as JSON.
pub(crate) fn parse_frame_json(data: &str, source: &str) -> Result<Value> {
    serde_json::from_str(data).map_err(|e| {
        Error::protocol_with_context(
            format!("malformed stream frame: {e}"),
            ErrorContext::new()
                .with_details(data.chars().take(120).collect::<String>())
                .with_source(source.to_string()),
        )
    })
}

pub(crate) fn u64_at(v: &Value, pointer: &str) -> u64 {
    v.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind_parsing() {
        assert_eq!("FastGPT".parse::<AdapterKind>().unwrap(), AdapterKind::FastGpt);
        assert_eq!(
            serde_json::from_str::<AdapterKind>("\"openai\"").unwrap(),
            AdapterKind::OpenAi
        );
        assert!("gemini".parse::<AdapterKind>().is_err());
    }

    #[test]
    fn test_codec_kind_round_trip() {
        for kind in [
            AdapterKind::OpenAi,
            AdapterKind::FastGpt,
            AdapterKind::Anthropic,
            AdapterKind::Dify,
        ] {
            assert_eq!(Codec::new(kind, CodecSettings::default()).kind(), kind);
        }
    }

    #[test]
    fn test_missing_model_is_validation_error() {
        let codec = Codec::new(AdapterKind::OpenAi, CodecSettings::default());
        let turn = TurnRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let err = codec.build_request(&turn, true).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.is_retryable());
    }
}
