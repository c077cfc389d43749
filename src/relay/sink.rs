//! Caller-facing event sinks.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::StreamEvent;
use crate::{Error, Result};

/// Transport the caller already has open (server-push, websocket, channel).
///
/// `send` may wait while the consumer is slow; the relay stops reading
/// upstream until it returns. An error means the consumer is gone.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: StreamEvent) -> Result<()>;
}

/// Bounded channel sink. The buffer size is the backpressure window.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: StreamEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::Cancelled)
    }
}

/// Sink for callers that only want the final outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl EventSink for DiscardSink {
    async fn send(&self, _event: StreamEvent) -> Result<()> {
        Ok(())
    }
}
