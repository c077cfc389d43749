//! 遥测钩子：保护层的重试、熔断状态变化与拒绝事件的观察者接口。
//!
//! Observability hooks for the protection layer.
//!
//! The gateway never forces a metrics backend: [`ProtectionService`] reports
//! what happened to a [`ProtectionObserver`], and the default
//! [`TracingObserver`] turns that into structured `tracing` events.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RetryAttemptRecord`] | One scheduled retry of an outbound call |
//! | [`ProtectionObserver`] | Trait for observability destinations |
//! | [`TracingObserver`] | Default, logs through `tracing` |
//! | [`NoopObserver`] | Discards everything |
//! | [`RecordingObserver`] | In-memory observer for tests |
//!
//! [`ProtectionService`]: crate::resilience::ProtectionService

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::ErrorKind;
use crate::resilience::{BreakerState, BreakerTransition};
use crate::types::ProviderIdentity;

/// One scheduled retry. Scoped to a single outbound call, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttemptRecord {
    pub identity: ProviderIdentity,
    /// Zero-based number of the attempt about to run (the first retry is 1).
    pub attempt_number: u32,
    pub delay_ms: u64,
    /// Failure of the previous attempt.
    pub cause: String,
    pub cause_kind: ErrorKind,
}

/// Receives protection-layer events. Called inline on the request path, so
/// implementations must not block.
pub trait ProtectionObserver: Send + Sync {
    fn on_retry(&self, _record: &RetryAttemptRecord) {}

    fn on_breaker_transition(&self, _identity: &ProviderIdentity, _transition: BreakerTransition) {}

    fn on_rate_limited(&self, _caller_key: &str, _retry_after_ms: u64) {}

    fn on_unavailable(&self, _identity: &ProviderIdentity, _retry_after_ms: Option<u64>) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProtectionObserver for NoopObserver {}

/// Logs protection events as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProtectionObserver for TracingObserver {
    fn on_retry(&self, record: &RetryAttemptRecord) {
        tracing::info!(
            identity = %record.identity,
            attempt = record.attempt_number,
            delay_ms = record.delay_ms,
            cause = %record.cause,
            "retrying upstream call"
        );
    }

    fn on_breaker_transition(&self, identity: &ProviderIdentity, transition: BreakerTransition) {
        match transition.to {
            BreakerState::Open => tracing::warn!(
                identity = %identity,
                from = ?transition.from,
                "circuit breaker opened"
            ),
            BreakerState::HalfOpen => tracing::info!(identity = %identity, "circuit breaker half-open, probing"),
            BreakerState::Closed => tracing::info!(identity = %identity, "circuit breaker closed"),
        }
    }

    fn on_rate_limited(&self, caller_key: &str, retry_after_ms: u64) {
        tracing::debug!(caller_key = %caller_key, retry_after_ms, "request rate limited");
    }

    fn on_unavailable(&self, identity: &ProviderIdentity, retry_after_ms: Option<u64>) {
        tracing::debug!(identity = %identity, retry_after_ms = ?retry_after_ms, "provider unavailable, breaker open");
    }
}

/// Recorded protection event.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    Retry(RetryAttemptRecord),
    Transition(ProviderIdentity, BreakerTransition),
    RateLimited(String, u64),
    Unavailable(ProviderIdentity, Option<u64>),
}

/// In-memory observer for tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: ObservedEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn retries(&self) -> Vec<RetryAttemptRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Retry(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

impl ProtectionObserver for RecordingObserver {
    fn on_retry(&self, record: &RetryAttemptRecord) {
        self.push(ObservedEvent::Retry(record.clone()));
    }

    fn on_breaker_transition(&self, identity: &ProviderIdentity, transition: BreakerTransition) {
        self.push(ObservedEvent::Transition(identity.clone(), transition));
    }

    fn on_rate_limited(&self, caller_key: &str, retry_after_ms: u64) {
        self.push(ObservedEvent::RateLimited(caller_key.to_string(), retry_after_ms));
    }

    fn on_unavailable(&self, identity: &ProviderIdentity, retry_after_ms: Option<u64>) {
        self.push(ObservedEvent::Unavailable(identity.clone(), retry_after_ms));
    }
}

/// Default observer handle.
pub fn tracing_observer() -> Arc<dyn ProtectionObserver> {
    Arc::new(TracingObserver)
}
