//! HTTP transport to provider endpoints and upstream failure classification.

pub mod http;

pub use http::{HttpTransport, TransportSettings};

use reqwest::header::HeaderMap;

use crate::Error;

/// Map a reqwest failure to the gateway taxonomy.
pub(crate) fn classify_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout {
            message: e.to_string(),
        }
    } else if e.is_decode() {
        Error::protocol_with_context(
            format!("undecodable upstream body: {e}"),
            crate::error::ErrorContext::new().with_source("http_transport"),
        )
    } else if let Some(status) = e.status() {
        classify_status(status.as_u16(), None, e.to_string())
    } else {
        // connect failures, resets and truncated bodies all look the same to us
        Error::UpstreamConnection {
            message: e.to_string(),
        }
    }
}

/// Map a non-success HTTP status.
///
/// 408, 429 and 5xx are transient and retryable; any other 4xx means the
/// request itself was refused and is surfaced without retrying.
pub(crate) fn classify_status(status: u16, retry_after_ms: Option<u64>, message: String) -> Error {
    match status {
        408 | 429 | 500..=599 => Error::UpstreamServer {
            status,
            message,
            retry_after_ms,
        },
        _ => Error::UpstreamRejected { status, message },
    }
}

/// Extract the first matching header value from a list of header names.
pub(crate) fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(v) = headers.get(*name) {
            if let Ok(s) = v.to_str() {
                let s = s.trim();
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}

/// Best-effort parsing of `Retry-After`.
///
/// Only the `Retry-After: <seconds>` form is supported; HTTP dates are ignored.
pub(crate) fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let raw = header_first(headers, &["retry-after"])?;
    let secs: u64 = raw.parse().ok()?;
    Some(secs.saturating_mul(1000))
}
