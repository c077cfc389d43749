//! # ai-lib-gateway
//!
//! 多厂商大模型对话网关：会话互斥、熔断、限流、重试，以及可中断的流式转发。
//!
//! Resilient chat gateway in front of several interchangeable LLM backends.
//!
//! ## Overview
//!
//! A caller sends one chat turn for one conversation to one configured
//! provider. The gateway guarantees:
//!
//! - **No duplicate turns**: at most one turn per conversation is in flight.
//! - **Failure isolation**: a failing provider is cut off by its circuit
//!   breaker and probed again after a cooldown.
//! - **Bounded rates**: each caller gets a fixed-window quota.
//! - **Graceful partial failure**: a stream that dies mid-response ends with
//!   an explicit interruption and keeps the content already produced.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_lib_gateway::{ChannelSink, ChatTurnRequest, Gateway, Message};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> ai_lib_gateway::Result<()> {
//!     let gateway = Gateway::builder().config_path("gateway.yaml").build()?;
//!
//!     let (sink, mut events) = ChannelSink::channel(64);
//!     let request = ChatTurnRequest::new(
//!         "conversation-1",
//!         "user-42",
//!         "openai:main",
//!         vec![Message::user("Hello!")],
//!     );
//!     let printer = tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{}", serde_json::to_string(&event).unwrap_or_default());
//!         }
//!     });
//!     let outcome = gateway.handle(request, &sink, &CancellationToken::new()).await;
//!     drop(sink);
//!     let _ = printer.await;
//!     println!("completed: {}", outcome.is_completed());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`gateway`] | Entry point: validation, provider resolution, session lock, relay |
//! | [`config`] | Config documents, provider registry, hot reload |
//! | [`drivers`] | Provider adapters and wire codecs |
//! | [`transport`] | HTTP transport and upstream failure classification |
//! | [`pipeline`] | SSE decoding and frame-to-event glue |
//! | [`resilience`] | Circuit breaker, rate limiter, retry policy, protection service |
//! | [`session`] | Per-conversation exclusivity |
//! | [`relay`] | Streaming relay and event sinks |
//! | [`persistence`] | Hand-off of finished turns |
//! | [`telemetry`] | Protection observers |
//! | [`signals`] | Facts-only runtime snapshots |
//! | [`types`] | Core type definitions (messages, events, tools) |

pub mod config;
pub mod drivers;
pub mod gateway;
pub mod persistence;
pub mod pipeline;
pub mod relay;
pub mod resilience;
pub mod session;
pub mod signals;
pub mod telemetry;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use config::{GatewayConfig, GatewaySettings, ProviderConfig, ProviderRegistry};
pub use drivers::{AdapterKind, ProviderAdapter};
pub use gateway::{ChatTurnRequest, Gateway, GatewayBuilder};
pub use persistence::{FinalizedMessage, PersistenceSink};
pub use relay::{ChannelSink, EventSink, FinalOutcome, Rejection};
pub use types::{
    events::{FinishReason, StreamEvent, Usage},
    identity::ProviderIdentity,
    message::{Message, MessageRole},
    tool::ToolCall,
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, ErrorKind};
