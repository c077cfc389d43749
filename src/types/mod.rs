//! # Types Module
//!
//! Core data types shared by every layer of the gateway.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ProviderIdentity`] | Opaque key of one configured backend |
//! | [`Message`] | Chat message with role and text content |
//! | [`StreamEvent`] | Normalized event emitted while a turn streams |
//! | [`FinishReason`] | Normalized reason a turn ended |
//! | [`ToolCall`] | Tool invocation folded from streamed deltas |

pub mod events;
pub mod identity;
pub mod message;
pub mod tool;

pub use events::{FinishReason, StreamEvent, ToolCallDelta, Usage};
pub use identity::ProviderIdentity;
pub use message::{Message, MessageRole};
pub use tool::{ToolCall, ToolCallAssembler};
