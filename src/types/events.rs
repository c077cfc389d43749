//! Normalized streaming events emitted to callers and folded into persisted messages.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Unified streaming event.
///
/// A single turn emits zero or more deltas and exactly one terminal event
/// (`Done`, or `Error` when the turn never produced a stream). An interrupted
/// stream ends with `Error { retryable: true }` followed by
/// `Done { finish_reason: Interrupted }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Partial text content.
    TokenDelta { text: String },

    /// Partial tool call (id/name on the first fragment, arguments streamed).
    ToolCallDelta(ToolCallDelta),

    /// Token accounting reported by the provider.
    UsageSummary(Usage),

    /// A failure; terminal unless followed by an interrupted `Done`.
    Error {
        kind: ErrorKind,
        retryable: bool,
        message: String,
    },

    /// Stream end.
    Done { finish_reason: FinishReason },
}

impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        StreamEvent::TokenDelta { text: text.into() }
    }

    pub fn done(finish_reason: FinishReason) -> Self {
        StreamEvent::Done { finish_reason }
    }

    pub fn error(err: &crate::Error, retryable: bool) -> Self {
        StreamEvent::Error {
            kind: err.kind(),
            retryable,
            message: err.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }
}

/// Streamed tool call fragment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Merge a later report into this one; providers split input and output
    /// counts across events, so zero fields never overwrite known values.
    pub fn merge(&mut self, later: Usage) {
        if later.prompt_tokens > 0 {
            self.prompt_tokens = later.prompt_tokens;
        }
        if later.completion_tokens > 0 {
            self.completion_tokens = later.completion_tokens;
        }
        self.total_tokens = if later.total_tokens > 0 {
            later.total_tokens.max(self.prompt_tokens + self.completion_tokens)
        } else {
            self.prompt_tokens + self.completion_tokens
        };
    }
}

/// Finish reason normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Upstream failure or caller cancellation before the provider finished.
    Interrupted,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Interrupted => "interrupted",
            FinishReason::Other(s) => s,
        }
    }

    /// Map a provider-native reason (OpenAI, Anthropic, Dify spellings) to the
    /// normalized set.
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "stop_sequence" | "normal" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" | "refusal" => FinishReason::ContentFilter,
            "interrupted" => FinishReason::Interrupted,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl From<String> for FinishReason {
    fn from(s: String) -> Self {
        FinishReason::from_provider(&s)
    }
}

impl From<FinishReason> for String {
    fn from(r: FinishReason) -> Self {
        r.as_str().to_string()
    }
}
