//! 网关入口：解析 provider、获取会话锁，再交给流式中继。
//!
//! # Gateway
//!
//! One call to [`Gateway::handle`] runs one chat turn end to end:
//!
//! 1. validate the request shape,
//! 2. resolve the provider from the live [`ProviderRegistry`],
//! 3. take the conversation's lease from the [`SessionCoordinator`],
//! 4. hand the turn to the [`StreamingRelay`] (streaming or not).
//!
//! Every refusal is reported twice: as a terminal `StreamEvent::Error` on the
//! caller's sink and as a [`FinalOutcome::Rejected`] return value.

pub mod builder;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{GatewaySettings, ProviderRegistry, ResolvedProvider};
use crate::drivers::TurnRequest;
use crate::error::{Error, ErrorContext};
use crate::relay::{
    rejection_event, send_terminal, ChannelSink, DiscardSink, EventSink, FinalOutcome, Rejection,
    StreamingRelay, TurnBuffer,
};
use crate::resilience::{ProtectionService, ProtectionTarget};
use crate::session::SessionCoordinator;
use crate::signals::{EvictionReport, SessionSignals, SignalsSnapshot};
use crate::types::{Message, ProviderIdentity, StreamEvent};

pub use builder::GatewayBuilder;

fn default_streaming() -> bool {
    true
}

/// One chat turn as received from the (already authenticated) caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurnRequest {
    pub conversation_id: String,
    /// Authenticated caller; the rate-limit partition key.
    pub caller_key: String,
    pub provider_identity: ProviderIdentity,
    pub messages: Vec<Message>,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatTurnRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        caller_key: impl Into<String>,
        provider_identity: impl Into<ProviderIdentity>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            caller_key: caller_key.into(),
            provider_identity: provider_identity.into(),
            messages,
            streaming: true,
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temp: f64) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    fn validate(&self) -> crate::Result<()> {
        let missing = |field: &str, what: &str| {
            Err(Error::validation_with_context(
                what.to_string(),
                ErrorContext::new()
                    .with_field_path(field.to_string())
                    .with_source("gateway"),
            ))
        };
        if self.conversation_id.trim().is_empty() {
            return missing("conversation_id", "conversation id must not be empty");
        }
        if self.caller_key.trim().is_empty() {
            return missing("caller_key", "caller key must not be empty");
        }
        if self.messages.is_empty() {
            return missing("messages", "a turn needs at least one message");
        }
        Ok(())
    }
}

/// Entry point for chat turns. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    sessions: Arc<SessionCoordinator>,
    relay: StreamingRelay,
    settings: GatewaySettings,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("providers", &self.registry.identities())
            .field("sessions", &self.sessions.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    pub(crate) fn from_parts(
        registry: Arc<ProviderRegistry>,
        sessions: Arc<SessionCoordinator>,
        relay: StreamingRelay,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            registry,
            sessions,
            relay,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionCoordinator> {
        &self.sessions
    }

    pub fn protection(&self) -> &ProtectionService {
        self.relay.protection()
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Run one chat turn, forwarding its events to `sink`.
    ///
    /// Cancelling `cancel` stops the turn: a streaming turn ends with
    /// `Done{Interrupted}` and its partial content is kept.
    pub async fn handle(
        &self,
        request: ChatTurnRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> FinalOutcome {
        let span = tracing::info_span!(
            "chat_turn",
            conversation_id = %request.conversation_id,
            provider = %request.provider_identity,
            streaming = request.streaming,
        );
        self.handle_inner(request, sink, cancel).instrument(span).await
    }

    async fn handle_inner(
        &self,
        request: ChatTurnRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> FinalOutcome {
        let close = self.relay.terminal_send_timeout();
        if let Err(err) = request.validate() {
            send_terminal(sink, vec![rejection_event(&err)], close).await;
            return FinalOutcome::from_error(err);
        }

        let Some(provider) = self.registry.get(request.provider_identity.as_str()) else {
            let err = Error::validation_with_context(
                format!("unknown provider '{}'", request.provider_identity),
                ErrorContext::new()
                    .with_field_path("provider_identity")
                    .with_source("gateway"),
            );
            tracing::debug!("rejected turn for unknown provider");
            send_terminal(sink, vec![rejection_event(&err)], close).await;
            return FinalOutcome::Rejected(Rejection::UnknownProvider {
                identity: request.provider_identity,
            });
        };

        let target = target_for(&provider, &request.caller_key);
        let buffer = TurnBuffer::new();
        let locked = self
            .sessions
            .with_lock(&request.conversation_id, cancel, |session| {
                let provider = &provider;
                let request = &request;
                let target = &target;
                let buffer = &buffer;
                async move {
                    let turn = TurnRequest {
                        conversation_id: request.conversation_id.clone(),
                        messages: request.messages.clone(),
                        user: Some(request.caller_key.clone()),
                        model: request.model.clone(),
                        provider_session_id: session.provider_session_id().map(String::from),
                        temperature: request.temperature,
                        max_tokens: request.max_tokens,
                    };
                    let adapter = provider.adapter.as_ref();
                    let outcome = if request.streaming {
                        self.relay
                            .relay(target, adapter, &turn, &session, sink, buffer)
                            .await
                    } else {
                        self.relay
                            .complete(target, adapter, &turn, &session, sink)
                            .await
                    };
                    Ok(outcome)
                }
            })
            .await;

        match locked {
            Ok(outcome) => outcome,
            Err(err @ Error::SessionBusy { .. }) => {
                tracing::debug!("conversation busy");
                send_terminal(sink, vec![rejection_event(&err)], close).await;
                FinalOutcome::from_error(err)
            }
            Err(err) => {
                let bound = self.sessions.provider_session_id(&request.conversation_id);
                self.relay
                    .abandon(
                        &target.identity,
                        &request.conversation_id,
                        bound.as_deref(),
                        &buffer,
                        sink,
                        err,
                    )
                    .await
            }
        }
    }

    /// Run a turn without observing its events.
    pub async fn chat(&self, request: ChatTurnRequest, cancel: &CancellationToken) -> FinalOutcome {
        self.handle(request, &DiscardSink, cancel).await
    }

    /// Run a turn on a background task; events arrive on the returned
    /// receiver and the outcome on the join handle.
    pub fn spawn_turn(
        &self,
        request: ChatTurnRequest,
        cancel: CancellationToken,
        buffer: usize,
    ) -> (mpsc::Receiver<StreamEvent>, JoinHandle<FinalOutcome>) {
        let (sink, rx) = ChannelSink::channel(buffer);
        let gateway = self.clone();
        let handle = tokio::spawn(async move { gateway.handle(request, &sink, &cancel).await });
        (rx, handle)
    }

    /// Destroy the session record of a deleted conversation.
    pub fn forget_conversation(&self, conversation_id: &str) -> bool {
        self.sessions.forget(conversation_id)
    }

    /// Facts about one provider's breaker, one caller's quota and the session
    /// table.
    pub fn signals(&self, identity: Option<&str>, caller_key: Option<&str>) -> SignalsSnapshot {
        let protection = self.relay.protection();
        SignalsSnapshot {
            breaker: identity.map(|id| protection.breaker().snapshot(&ProviderIdentity::new(id))),
            rate_limit: caller_key.and_then(|key| protection.limiter().snapshot(key)),
            sessions: SessionSignals {
                tracked: self.sessions.len(),
                active_leases: self.sessions.active_leases(),
            },
        }
    }

    /// One eviction pass over breakers, buckets and idle session records.
    pub fn evict_idle(&self) -> EvictionReport {
        let ttl = self.settings.idle_ttl();
        let protection = self.relay.protection();
        EvictionReport {
            breakers: protection.breaker().evict_idle(ttl),
            buckets: protection.limiter().evict_idle(ttl),
            sessions: self.sessions.evict_idle(),
        }
    }

    /// Run [`Gateway::evict_idle`] every `maintenance_interval` until `cancel`
    /// fires.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.settings.maintenance_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = gateway.evict_idle();
                        if report.total() > 0 {
                            tracing::debug!(
                                breakers = report.breakers,
                                buckets = report.buckets,
                                sessions = report.sessions,
                                "evicted idle gateway state"
                            );
                        }
                    }
                }
            }
        })
    }
}

fn target_for(provider: &ResolvedProvider, caller_key: &str) -> ProtectionTarget {
    ProtectionTarget {
        identity: provider.identity().clone(),
        caller_key: caller_key.to_string(),
        policy: provider.policy.clone(),
    }
}
