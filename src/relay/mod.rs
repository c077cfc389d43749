//! 流式中继：在保护层之内驱动适配器的流，逐个转发事件，并在中断时保留已生成的内容。
//!
//! # Streaming relay
//!
//! Opens the adapter's stream inside [`ProtectionService::execute`] (so opening
//! is rate limited, breaker guarded and retried), then forwards every event to
//! the caller's [`EventSink`] as soon as it arrives. Nothing is buffered ahead
//! of the sink: a slow sink pauses the upstream read.
//!
//! Terminal sequences seen by the sink:
//!
//! | Situation | Events |
//! |-----------|--------|
//! | provider finished | deltas…, `Done{finish_reason}` |
//! | upstream dropped mid-stream | deltas…, `Error{retryable}`, `Done{interrupted}` |
//! | caller cancelled | deltas…, `Done{interrupted}` |
//! | rejected or failed before streaming | `Error{..}` |
//!
//! Closing events are delivered within a bounded time; a consumer that stops
//! reading loses them but never holds the turn open.
//!
//! Completed turns, and interrupted turns with partial content, are handed to
//! the [`PersistenceSink`] fire-and-forget.

pub mod sink;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::drivers::{DriverResponse, ProviderAdapter, TurnRequest};
use crate::persistence::{hand_off, FinalizedMessage, PersistenceSink};
use crate::pipeline::UpstreamEvent;
use crate::resilience::{ProtectionService, ProtectionTarget};
use crate::session::SessionHandle;
use crate::types::{
    FinishReason, MessageRole, ProviderIdentity, StreamEvent, ToolCallAssembler, ToolCallDelta,
    Usage,
};
use crate::Error;

pub use sink::{ChannelSink, DiscardSink, EventSink};

/// Structured reasons a turn was refused. Expected steady-state outcomes,
/// not faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    RateLimited {
        retry_after_ms: u64,
    },
    Unavailable {
        identity: ProviderIdentity,
        retry_after_ms: Option<u64>,
    },
    SessionBusy {
        conversation_id: String,
    },
    BadRequest {
        message: String,
    },
    UnknownProvider {
        identity: ProviderIdentity,
    },
}

/// How a turn ended.
#[derive(Debug)]
pub enum FinalOutcome {
    Completed(FinalizedMessage),
    /// Ended early; `message` holds whatever was produced before the cut.
    Interrupted {
        message: FinalizedMessage,
        cause: Error,
    },
    Rejected(Rejection),
    /// Upstream failure surfaced after retries, with enough detail to decide
    /// whether to try a different provider.
    Failed(Error),
}

impl FinalOutcome {
    /// Classify a failure that happened before any content was produced.
    pub fn from_error(err: Error) -> Self {
        match err {
            Error::RateLimited { retry_after_ms, .. } => {
                FinalOutcome::Rejected(Rejection::RateLimited { retry_after_ms })
            }
            Error::Unavailable {
                identity,
                retry_after_ms,
            } => FinalOutcome::Rejected(Rejection::Unavailable {
                identity,
                retry_after_ms,
            }),
            Error::SessionBusy { conversation_id } => {
                FinalOutcome::Rejected(Rejection::SessionBusy { conversation_id })
            }
            Error::Validation { .. } => FinalOutcome::Rejected(Rejection::BadRequest {
                message: err.to_string(),
            }),
            other => FinalOutcome::Failed(other),
        }
    }

    pub fn message(&self) -> Option<&FinalizedMessage> {
        match self {
            FinalOutcome::Completed(m) | FinalOutcome::Interrupted { message: m, .. } => Some(m),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, FinalOutcome::Completed(_))
    }
}

/// Whether a caller could reasonably retry the same turn later.
fn caller_may_retry(err: &Error) -> bool {
    err.is_retryable()
        || matches!(
            err,
            Error::RateLimited { .. } | Error::Unavailable { .. } | Error::SessionBusy { .. }
        )
}

/// Terminal error event for a turn that never streamed.
pub(crate) fn rejection_event(err: &Error) -> StreamEvent {
    StreamEvent::error(err, caller_may_retry(err))
}

/// Upper bound for delivering the closing events of a turn.
pub const DEFAULT_TERMINAL_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Deliver the closing events of a turn, giving up after `limit`. A consumer
/// that holds its receiver but stops reading cannot keep the turn open.
pub(crate) async fn send_terminal(sink: &dyn EventSink, events: Vec<StreamEvent>, limit: Duration) {
    let delivered = tokio::time::timeout(limit, async {
        for event in events {
            if sink.send(event).await.is_err() {
                break;
            }
        }
    })
    .await;
    if delivered.is_err() {
        tracing::debug!(
            timeout_ms = limit.as_millis() as u64,
            "consumer stopped reading, closing events dropped"
        );
    }
}

/// Events folded into the message handed to persistence.
#[derive(Debug, Default)]
struct Accumulator {
    text: String,
    tools: ToolCallAssembler,
    usage: Option<Usage>,
    provider_session_id: Option<String>,
}

impl Accumulator {
    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TokenDelta { text } => self.text.push_str(text),
            StreamEvent::ToolCallDelta(delta) => self.tools.on_delta(delta),
            StreamEvent::UsageSummary(usage) => match self.usage.as_mut() {
                Some(current) => current.merge(*usage),
                None => self.usage = Some(*usage),
            },
            StreamEvent::Error { .. } | StreamEvent::Done { .. } => {}
        }
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.tools.is_empty()
    }

    fn finalize(
        self,
        identity: &ProviderIdentity,
        conversation_id: &str,
        bound_session: Option<&str>,
        finish_reason: FinishReason,
    ) -> FinalizedMessage {
        FinalizedMessage {
            conversation_id: conversation_id.to_string(),
            role: MessageRole::Assistant,
            content: self.text,
            finish_reason,
            usage: self.usage,
            tool_calls: self.tools.finalize(),
            provider_identity: identity.clone(),
            provider_session_id: self
                .provider_session_id
                .or_else(|| bound_session.map(String::from)),
        }
    }
}

/// Content received so far by one streaming turn.
///
/// Owned by whoever runs the turn, so a turn dropped at the hard-timeout
/// deadline still leaves its partial message behind. Taking the content
/// empties the buffer; a turn is persisted at most once.
#[derive(Debug, Clone, Default)]
pub struct TurnBuffer(Arc<Mutex<Accumulator>>);

impl TurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Accumulator) -> R) -> R {
        let mut acc = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut acc)
    }

    fn observe(&self, event: &StreamEvent) {
        self.with(|acc| acc.observe(event));
    }

    fn bind_provider_session(&self, id: String) {
        self.with(|acc| acc.provider_session_id = Some(id));
    }

    fn received_chars(&self) -> usize {
        self.with(|acc| acc.text.chars().count())
    }

    fn take(&self) -> Accumulator {
        self.with(std::mem::take)
    }

    pub fn is_empty(&self) -> bool {
        self.with(|acc| acc.is_empty())
    }
}

enum Step {
    Cancelled,
    Next(Option<crate::Result<UpstreamEvent>>),
}

#[derive(Clone)]
pub struct StreamingRelay {
    protection: ProtectionService,
    persistence: Arc<dyn PersistenceSink>,
    terminal_send_timeout: Duration,
}

impl std::fmt::Debug for StreamingRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRelay")
            .field("protection", &self.protection)
            .field("terminal_send_timeout", &self.terminal_send_timeout)
            .finish_non_exhaustive()
    }
}

impl StreamingRelay {
    pub fn new(protection: ProtectionService, persistence: Arc<dyn PersistenceSink>) -> Self {
        Self {
            protection,
            persistence,
            terminal_send_timeout: DEFAULT_TERMINAL_SEND_TIMEOUT,
        }
    }

    /// Bound for delivering `Done` and terminal `Error` events.
    pub fn with_terminal_send_timeout(mut self, limit: Duration) -> Self {
        self.terminal_send_timeout = limit;
        self
    }

    pub fn protection(&self) -> &ProtectionService {
        &self.protection
    }

    pub fn terminal_send_timeout(&self) -> Duration {
        self.terminal_send_timeout
    }

    /// Forward one event unless the caller cancelled or went away.
    async fn emit(sink: &dyn EventSink, event: StreamEvent, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            r = sink.send(event) => r.is_ok(),
        }
    }

    async fn close(&self, sink: &dyn EventSink, events: Vec<StreamEvent>) {
        send_terminal(sink, events, self.terminal_send_timeout).await;
    }

    fn persist(&self, message: &FinalizedMessage) {
        hand_off(Arc::clone(&self.persistence), message.clone());
    }

    /// Interrupted turns keep their partial content; empty ones are dropped.
    fn interrupted(
        &self,
        acc: Accumulator,
        identity: &ProviderIdentity,
        conversation_id: &str,
        bound_session: Option<&str>,
        cause: Error,
    ) -> FinalOutcome {
        let empty = acc.is_empty();
        let message = acc.finalize(identity, conversation_id, bound_session, FinishReason::Interrupted);
        if !empty {
            self.persist(&message);
        }
        FinalOutcome::Interrupted { message, cause }
    }

    /// Relay one streaming turn to `sink`, collecting its content in `buffer`.
    ///
    /// The provider only counts as healthy once its stream reaches `Done`; a
    /// stream that opens and then drops counts as one failed call.
    pub async fn relay(
        &self,
        target: &ProtectionTarget,
        adapter: &dyn ProviderAdapter,
        turn: &TurnRequest,
        session: &SessionHandle,
        sink: &dyn EventSink,
        buffer: &TurnBuffer,
    ) -> FinalOutcome {
        let cancel = session.cancel_token();
        let conversation_id = session.conversation_id();
        let opened = self
            .protection
            .execute_pending(target, cancel, |_| adapter.open_stream(turn, cancel))
            .await;

        let (mut stream, pending) = match opened {
            Ok(opened) => opened,
            Err(Error::Cancelled) => {
                let cause = session.interruption_cause();
                let outcome = self.interrupted(
                    buffer.take(),
                    &target.identity,
                    conversation_id,
                    session.provider_session_id(),
                    cause,
                );
                self.close(sink, vec![StreamEvent::done(FinishReason::Interrupted)])
                    .await;
                return outcome;
            }
            Err(err) => {
                tracing::debug!(identity = %target.identity, error = %err, "turn not started");
                self.close(sink, vec![rejection_event(&err)]).await;
                return FinalOutcome::from_error(err);
            }
        };

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                item = stream.next() => Step::Next(item),
            };

            let event = match step {
                Step::Cancelled => {
                    drop(stream);
                    // neither a success nor the provider's failure
                    drop(pending);
                    tracing::debug!(
                        identity = %target.identity,
                        hard_timeout = session.hit_hard_timeout(),
                        "turn cancelled mid-stream"
                    );
                    return self.cancelled_mid_stream(target, session, sink, buffer).await;
                }
                Step::Next(Some(Ok(UpstreamEvent::ProviderSession(id)))) => {
                    session.bind_provider_session(&id);
                    buffer.bind_provider_session(id);
                    continue;
                }
                Step::Next(Some(Ok(UpstreamEvent::Event(event)))) => event,
                Step::Next(Some(Err(err))) => {
                    drop(stream);
                    if err.is_provider_fault() {
                        pending.fail();
                    }
                    return self.on_stream_failure(target, session, sink, buffer, err).await;
                }
                Step::Next(None) => {
                    drop(stream);
                    pending.fail();
                    let err = Error::UpstreamConnection {
                        message: "stream ended before the provider finished".to_string(),
                    };
                    return self.on_stream_failure(target, session, sink, buffer, err).await;
                }
            };

            buffer.observe(&event);
            if let StreamEvent::Done { finish_reason } = &event {
                pending.succeed();
                let message = buffer.take().finalize(
                    &target.identity,
                    conversation_id,
                    session.provider_session_id(),
                    finish_reason.clone(),
                );
                self.persist(&message);
                self.close(sink, vec![event]).await;
                return FinalOutcome::Completed(message);
            }

            if !Self::emit(sink, event, cancel).await {
                // the consumer is gone or cancelled while we waited on it
                drop(stream);
                drop(pending);
                return self.cancelled_mid_stream(target, session, sink, buffer).await;
            }
        }
    }

    async fn cancelled_mid_stream(
        &self,
        target: &ProtectionTarget,
        session: &SessionHandle,
        sink: &dyn EventSink,
        buffer: &TurnBuffer,
    ) -> FinalOutcome {
        let outcome = self.interrupted(
            buffer.take(),
            &target.identity,
            session.conversation_id(),
            session.provider_session_id(),
            session.interruption_cause(),
        );
        self.close(sink, vec![StreamEvent::done(FinishReason::Interrupted)])
            .await;
        outcome
    }

    async fn on_stream_failure(
        &self,
        target: &ProtectionTarget,
        session: &SessionHandle,
        sink: &dyn EventSink,
        buffer: &TurnBuffer,
        err: Error,
    ) -> FinalOutcome {
        let retryable = err.is_retryable();
        let received_chars = buffer.received_chars();
        let cause = Error::StreamInterrupted {
            message: err.to_string(),
            received_chars,
        };
        tracing::warn!(
            identity = %target.identity,
            conversation_id = %session.conversation_id(),
            received_chars,
            error = %err,
            "upstream stream interrupted"
        );
        let error_event = StreamEvent::error(&cause, retryable);
        let outcome = self.interrupted(
            buffer.take(),
            &target.identity,
            session.conversation_id(),
            session.provider_session_id(),
            cause,
        );
        self.close(
            sink,
            vec![error_event, StreamEvent::done(FinishReason::Interrupted)],
        )
        .await;
        outcome
    }

    /// Close a turn that was dropped before it reached a terminal event,
    /// keeping whatever content `buffer` still holds.
    pub(crate) async fn abandon(
        &self,
        identity: &ProviderIdentity,
        conversation_id: &str,
        bound_session: Option<&str>,
        buffer: &TurnBuffer,
        sink: &dyn EventSink,
        cause: Error,
    ) -> FinalOutcome {
        tracing::warn!(
            identity = %identity,
            conversation_id = %conversation_id,
            error = %cause,
            "turn dropped without a terminal event"
        );
        let events = vec![
            rejection_event(&cause),
            StreamEvent::done(FinishReason::Interrupted),
        ];
        let outcome = if buffer.is_empty() {
            FinalOutcome::Failed(cause)
        } else {
            self.interrupted(buffer.take(), identity, conversation_id, bound_session, cause)
        };
        self.close(sink, events).await;
        outcome
    }

    /// Run one non-streaming turn. The single response is replayed to `sink`
    /// as one text delta, its tool calls, usage and `Done`, and persisted like
    /// a completed stream.
    pub async fn complete(
        &self,
        target: &ProtectionTarget,
        adapter: &dyn ProviderAdapter,
        turn: &TurnRequest,
        session: &SessionHandle,
        sink: &dyn EventSink,
    ) -> FinalOutcome {
        let cancel = session.cancel_token();
        let response = self
            .protection
            .execute(target, cancel, |_| adapter.complete(turn, cancel))
            .await;

        let DriverResponse {
            content,
            finish_reason,
            usage,
            tool_calls,
            provider_session_id,
        } = match response {
            Ok(response) => response,
            Err(Error::Cancelled) => {
                let outcome = self.interrupted(
                    Accumulator::default(),
                    &target.identity,
                    session.conversation_id(),
                    session.provider_session_id(),
                    session.interruption_cause(),
                );
                self.close(sink, vec![StreamEvent::done(FinishReason::Interrupted)])
                    .await;
                return outcome;
            }
            Err(err) => {
                tracing::debug!(identity = %target.identity, error = %err, "turn not completed");
                self.close(sink, vec![rejection_event(&err)]).await;
                return FinalOutcome::from_error(err);
            }
        };

        if let Some(id) = provider_session_id.as_deref() {
            session.bind_provider_session(id);
        }
        let message = FinalizedMessage {
            conversation_id: session.conversation_id().to_string(),
            role: MessageRole::Assistant,
            content,
            finish_reason,
            usage,
            tool_calls,
            provider_identity: target.identity.clone(),
            provider_session_id: provider_session_id
                .or_else(|| session.provider_session_id().map(String::from)),
        };
        self.persist(&message);
        self.close(sink, replay_events(&message)).await;
        FinalOutcome::Completed(message)
    }
}

/// Events equivalent to a completed non-streaming response.
fn replay_events(message: &FinalizedMessage) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    if !message.content.is_empty() {
        events.push(StreamEvent::token(message.content.clone()));
    }
    for (index, call) in message.tool_calls.iter().enumerate() {
        let arguments = match &call.arguments {
            serde_json::Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        events.push(StreamEvent::ToolCallDelta(ToolCallDelta {
            index: index as u32,
            id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            arguments,
        }));
    }
    if let Some(usage) = message.usage {
        events.push(StreamEvent::UsageSummary(usage));
    }
    events.push(StreamEvent::done(message.finish_reason.clone()));
    events
}
