//! 持久化交接：把完成或被中断的回复交给外部持久化协作者。
//!
//! Hand-off of finished turns to the surrounding product's message store.
//!
//! The gateway does not own chat history. When a turn finishes (completed or
//! interrupted with partial content) one [`FinalizedMessage`] is handed to a
//! [`PersistenceSink`]. The hand-off is fire-and-forget: a failing sink is
//! logged and never changes the outcome reported to the caller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::types::{FinishReason, MessageRole, ProviderIdentity, ToolCall, Usage};
use crate::Result;

/// The message folded from one turn's events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedMessage {
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub provider_identity: ProviderIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_session_id: Option<String>,
}

impl FinalizedMessage {
    pub fn is_interrupted(&self) -> bool {
        self.finish_reason == FinishReason::Interrupted
    }
}

/// Destination for finalized messages.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn persist(&self, message: FinalizedMessage) -> Result<()>;
}

/// No-op sink (default).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl PersistenceSink for NoopPersistence {
    async fn persist(&self, _message: FinalizedMessage) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink for testing.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPersistence {
    messages: Arc<Mutex<Vec<FinalizedMessage>>>,
    notify: Arc<Notify>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<FinalizedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` messages arrived or `timeout` elapsed.
    /// Returns the messages seen so far.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<FinalizedMessage> {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.messages()
    }
}

#[async_trait]
impl PersistenceSink for InMemoryPersistence {
    async fn persist(&self, message: FinalizedMessage) -> Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Hand `message` to `sink` on a background task.
pub(crate) fn hand_off(sink: Arc<dyn PersistenceSink>, message: FinalizedMessage) {
    tokio::spawn(async move {
        let conversation_id = message.conversation_id.clone();
        if let Err(e) = sink.persist(message).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "persisting finalized message failed");
        }
    });
}

pub fn noop_persistence() -> Arc<dyn PersistenceSink> {
    Arc::new(NoopPersistence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> FinalizedMessage {
        FinalizedMessage {
            conversation_id: "c1".into(),
            role: MessageRole::Assistant,
            content: content.into(),
            finish_reason: FinishReason::Interrupted,
            usage: None,
            tool_calls: Vec::new(),
            provider_identity: ProviderIdentity::new("openai:main"),
            provider_session_id: None,
        }
    }

    #[tokio::test]
    async fn test_hand_off_reaches_sink() {
        let store = InMemoryPersistence::new();
        hand_off(Arc::new(store.clone()), message("partial"));
        let seen = store.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_interrupted());
    }

    #[test]
    fn test_wire_shape() {
        let v = serde_json::to_value(message("abc")).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(v["finish_reason"], "interrupted");
        assert_eq!(v["provider_identity"], "openai:main");
        assert!(v.get("usage").is_none());
    }
}
