//! 流水线处理模块：把上游字节流转换为统一的流式事件。
//!
//! # Streaming pipeline
//!
//! ```text
//! Raw Bytes → SseDecoder → StreamParser (per provider) → UpstreamEvent stream
//! ```
//!
//! The resulting stream is pull-based: nothing is read from the network until
//! the consumer polls, so a slow consumer pauses the upstream read instead of
//! growing a buffer. Dropping the stream drops the HTTP response and releases
//! the connection.
//!
//! Termination rules:
//! - `Done` is yielded exactly once, when the provider signals the end of the
//!   message (or at EOF after the provider reported a finish reason).
//! - EOF without any end signal is a dropped connection and yields
//!   `Err(UpstreamConnection)`.
//! - An in-band provider error yields `Err(ProviderStream)`.
//! - No chunk within the idle timeout yields `Err(UpstreamTimeout)`.
//!
//! Nothing is yielded after a terminal item.

pub mod decode;

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};

use crate::types::{FinishReason, StreamEvent};
use crate::{BoxStream, Error, Result};

pub use decode::{SseDecoder, SseFrame};

/// What a provider parser extracts from one SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamSignal {
    /// A delta or usage event to forward.
    Event(StreamEvent),
    /// Provider reported why generation stopped; the stream may still carry
    /// trailing usage frames.
    Finish(FinishReason),
    /// Provider signalled the end of the message.
    Terminate,
    /// Provider-side conversation/session id.
    ProviderSession(String),
    /// In-band provider error frame.
    Failure { message: String, retryable: bool },
}

/// Item of an adapter stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Event(StreamEvent),
    ProviderSession(String),
}

/// Stream returned by `ProviderAdapter::open_stream`.
pub type EventStream = BoxStream<'static, UpstreamEvent>;

/// Per-provider frame interpreter. Implementations may keep state across
/// frames (e.g. input usage reported at message start).
pub trait StreamParser: Send {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<UpstreamSignal>>;
}

struct DecodeState {
    input: BoxStream<'static, Bytes>,
    decoder: SseDecoder,
    parser: Box<dyn StreamParser>,
    queue: VecDeque<Result<UpstreamEvent>>,
    finish: Option<FinishReason>,
    idle_timeout: Option<Duration>,
    ended: bool,
}

impl DecodeState {
    fn on_frame(&mut self, frame: &SseFrame) {
        if self.ended {
            return;
        }
        let signals = match self.parser.on_frame(frame) {
            Ok(signals) => signals,
            Err(e) => {
                self.queue.push_back(Err(e));
                self.ended = true;
                return;
            }
        };
        for signal in signals {
            match signal {
                UpstreamSignal::Event(ev) => self.queue.push_back(Ok(UpstreamEvent::Event(ev))),
                UpstreamSignal::ProviderSession(id) => {
                    self.queue.push_back(Ok(UpstreamEvent::ProviderSession(id)))
                }
                UpstreamSignal::Finish(reason) => self.finish = Some(reason),
                UpstreamSignal::Terminate => {
                    let reason = self.finish.take().unwrap_or(FinishReason::Stop);
                    self.queue
                        .push_back(Ok(UpstreamEvent::Event(StreamEvent::done(reason))));
                    self.ended = true;
                    return;
                }
                UpstreamSignal::Failure { message, retryable } => {
                    self.queue
                        .push_back(Err(Error::ProviderStream { message, retryable }));
                    self.ended = true;
                    return;
                }
            }
        }
    }

    fn on_eof(&mut self) {
        if let Some(frame) = self.decoder.finish() {
            self.on_frame(&frame);
        }
        if self.ended {
            return;
        }
        match self.finish.take() {
            Some(reason) => self
                .queue
                .push_back(Ok(UpstreamEvent::Event(StreamEvent::done(reason)))),
            None => self.queue.push_back(Err(Error::UpstreamConnection {
                message: "stream closed before the provider finished".to_string(),
            })),
        }
        self.ended = true;
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.input.next()).await {
                Ok(item) => item,
                Err(_) => Some(Err(Error::UpstreamTimeout {
                    message: format!("no stream data within {}ms", limit.as_millis()),
                })),
            },
            None => self.input.next().await,
        }
    }
}

/// Turn a raw SSE byte stream into an `EventStream` using `parser`.
pub fn event_stream(
    input: BoxStream<'static, Bytes>,
    parser: Box<dyn StreamParser>,
    idle_timeout: Option<Duration>,
) -> EventStream {
    let state = DecodeState {
        input,
        decoder: SseDecoder::new(),
        parser,
        queue: VecDeque::new(),
        finish: None,
        idle_timeout,
        ended: false,
    };

    let stream = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some((item, state));
            }
            if state.ended {
                return None;
            }
            match state.next_chunk().await {
                Some(Ok(chunk)) => match state.decoder.push(&chunk) {
                    Ok(frames) => {
                        for frame in frames {
                            state.on_frame(&frame);
                        }
                    }
                    Err(e) => {
                        state.queue.push_back(Err(e));
                        state.ended = true;
                    }
                },
                Some(Err(e)) => {
                    state.queue.push_back(Err(e));
                    state.ended = true;
                }
                None => state.on_eof(),
            }
        }
    });

    Box::pin(stream)
}
