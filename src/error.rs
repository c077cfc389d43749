use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ProviderIdentity;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "providers[0].endpoint")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_validator", "anthropic_codec")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire-level classification of a failure, carried by `StreamEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Unavailable,
    UpstreamTimeout,
    UpstreamConnection,
    UpstreamServer,
    UpstreamRejected,
    SessionBusy,
    StreamInterrupted,
    Cancelled,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::UpstreamConnection => "upstream_connection",
            ErrorKind::UpstreamServer => "upstream_server",
            ErrorKind::UpstreamRejected => "upstream_rejected",
            ErrorKind::SessionBusy => "session_busy",
            ErrorKind::StreamInterrupted => "stream_interrupted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Unified error type for the gateway.
///
/// Upstream variants carry enough detail for a caller to decide whether to try
/// a different provider; `is_retryable` is the only retry classifier.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Rate limited: caller '{caller_key}' may retry in {retry_after_ms}ms")]
    RateLimited {
        caller_key: String,
        retry_after_ms: u64,
    },

    #[error("Provider '{identity}' unavailable: circuit breaker open")]
    Unavailable {
        identity: ProviderIdentity,
        retry_after_ms: Option<u64>,
    },

    #[error("Upstream timeout: {message}")]
    UpstreamTimeout { message: String },

    #[error("Upstream connection error: {message}")]
    UpstreamConnection { message: String },

    #[error("Upstream server error: HTTP {status}: {message}")]
    UpstreamServer {
        status: u16,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Upstream rejected request: HTTP {status}: {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("Provider stream error: {message}")]
    ProviderStream { message: String, retryable: bool },

    #[error("Conversation '{conversation_id}' already has a turn in flight")]
    SessionBusy { conversation_id: String },

    #[error("Stream interrupted after {received_chars} chars: {message}")]
    StreamInterrupted {
        message: String,
        received_chars: usize,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Protocol error: {message}{}", format_context(.context))]
    Protocol {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn protocol_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Protocol {
            message: msg.into(),
            context,
        }
    }

    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Timeouts, connection resets, 5xx-equivalents and retryable in-band
    /// stream errors. Everything else is surfaced on first occurrence.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::UpstreamTimeout { .. }
            | Error::UpstreamConnection { .. }
            | Error::UpstreamServer { .. } => true,
            Error::ProviderStream { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether this failure is the provider's doing and should count against
    /// its circuit breaker.
    pub fn is_provider_fault(&self) -> bool {
        matches!(
            self,
            Error::UpstreamTimeout { .. }
                | Error::UpstreamConnection { .. }
                | Error::UpstreamServer { .. }
                | Error::UpstreamRejected { .. }
                | Error::ProviderStream { .. }
                | Error::Protocol { .. }
        )
    }

    /// Upstream-suggested delay before retrying, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            Error::Unavailable { retry_after_ms, .. } => *retry_after_ms,
            Error::UpstreamServer { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Unavailable { .. } => ErrorKind::Unavailable,
            Error::UpstreamTimeout { .. } => ErrorKind::UpstreamTimeout,
            Error::UpstreamConnection { .. } => ErrorKind::UpstreamConnection,
            Error::UpstreamServer { .. } | Error::ProviderStream { .. } => {
                ErrorKind::UpstreamServer
            }
            Error::UpstreamRejected { .. } => ErrorKind::UpstreamRejected,
            Error::SessionBusy { .. } => ErrorKind::SessionBusy,
            Error::StreamInterrupted { .. } => ErrorKind::StreamInterrupted,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Validation { .. } => ErrorKind::InvalidRequest,
            Error::Protocol { .. } => ErrorKind::UpstreamServer,
            Error::Configuration { .. }
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Yaml(_) => ErrorKind::Internal,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Protocol { context, .. }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. } => Some(context),
            _ => None,
        }
    }
}
