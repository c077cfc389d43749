//! Shared fixtures: a scripted in-process adapter and a mockito server wrapper.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ai_lib_gateway::config::ProviderConfig;
use ai_lib_gateway::drivers::{AdapterKind, DriverResponse, ProviderAdapter, TurnRequest};
use ai_lib_gateway::pipeline::{EventStream, UpstreamEvent};
use ai_lib_gateway::{Error, FinishReason, StreamEvent, Usage};
use async_trait::async_trait;
use futures::stream;
use mockito::{Mock, Server, ServerGuard};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// One element of a scripted stream.
#[derive(Clone)]
pub enum Chunk {
    Token(&'static str),
    Session(&'static str),
    Usage(u64, u64),
    Finish(FinishReason),
    /// Fail the stream with a connection reset.
    Reset,
    /// Wait until the gate is opened.
    Hold(Arc<Notify>),
}

/// What one adapter call does.
#[derive(Clone)]
pub enum Attempt {
    /// Fail before any content with the produced error.
    Fail(fn() -> Error),
    Stream(Vec<Chunk>),
}

pub fn reset() -> Error {
    Error::UpstreamConnection {
        message: "connection reset by peer".into(),
    }
}

pub fn bad_request() -> Error {
    Error::UpstreamRejected {
        status: 400,
        message: "invalid model".into(),
    }
}

pub fn ok_stream(tokens: &[&'static str]) -> Attempt {
    let mut chunks: Vec<Chunk> = tokens.iter().map(|t| Chunk::Token(*t)).collect();
    chunks.push(Chunk::Finish(FinishReason::Stop));
    Attempt::Stream(chunks)
}

/// Adapter that replays scripted attempts in order, then repeats `fallback`.
#[derive(Debug)]
pub struct ScriptedAdapter {
    script: Mutex<VecDeque<AttemptSlot>>,
    fallback: AttemptSlot,
    attempts: AtomicU32,
    seen_sessions: Mutex<Vec<Option<String>>>,
}

#[derive(Clone)]
struct AttemptSlot(Attempt);

impl std::fmt::Debug for AttemptSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Attempt")
    }
}

impl ScriptedAdapter {
    pub fn new(script: Vec<Attempt>) -> Arc<Self> {
        Self::with_fallback(script, ok_stream(&["ok"]))
    }

    pub fn with_fallback(script: Vec<Attempt>, fallback: Attempt) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().map(AttemptSlot).collect()),
            fallback: AttemptSlot(fallback),
            attempts: AtomicU32::new(0),
            seen_sessions: Mutex::new(Vec::new()),
        })
    }

    /// Network attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Provider session id each call was made with.
    pub fn seen_sessions(&self) -> Vec<Option<String>> {
        self.seen_sessions.lock().unwrap().clone()
    }

    fn next(&self, request: &TurnRequest) -> Attempt {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.seen_sessions
            .lock()
            .unwrap()
            .push(request.provider_session_id.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
            .0
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::OpenAi
    }

    async fn complete(
        &self,
        request: &TurnRequest,
        _cancel: &CancellationToken,
    ) -> ai_lib_gateway::Result<DriverResponse> {
        let chunks = match self.next(request) {
            Attempt::Fail(make) => return Err(make()),
            Attempt::Stream(chunks) => chunks,
        };
        let mut response = DriverResponse {
            content: String::new(),
            finish_reason: FinishReason::Stop,
            usage: None,
            tool_calls: Vec::new(),
            provider_session_id: None,
        };
        for chunk in chunks {
            match chunk {
                Chunk::Token(t) => response.content.push_str(t),
                Chunk::Session(s) => response.provider_session_id = Some(s.to_string()),
                Chunk::Usage(p, c) => response.usage = Some(Usage::new(p, c)),
                Chunk::Finish(reason) => response.finish_reason = reason,
                Chunk::Reset => return Err(reset()),
                Chunk::Hold(gate) => gate.notified().await,
            }
        }
        Ok(response)
    }

    async fn open_stream(
        &self,
        request: &TurnRequest,
        _cancel: &CancellationToken,
    ) -> ai_lib_gateway::Result<EventStream> {
        let chunks = match self.next(request) {
            Attempt::Fail(make) => return Err(make()),
            Attempt::Stream(chunks) => chunks,
        };
        let queue: VecDeque<Chunk> = chunks.into();
        let events = stream::unfold(queue, |mut queue| async move {
            loop {
                let item = match queue.pop_front()? {
                    Chunk::Token(t) => Ok(UpstreamEvent::Event(StreamEvent::token(t))),
                    Chunk::Session(s) => Ok(UpstreamEvent::ProviderSession(s.to_string())),
                    Chunk::Usage(p, c) => Ok(UpstreamEvent::Event(StreamEvent::UsageSummary(
                        Usage::new(p, c),
                    ))),
                    Chunk::Finish(reason) => {
                        queue.clear();
                        Ok(UpstreamEvent::Event(StreamEvent::done(reason)))
                    }
                    Chunk::Reset => {
                        queue.clear();
                        Err(reset())
                    }
                    Chunk::Hold(gate) => {
                        gate.notified().await;
                        continue;
                    }
                };
                return Some((item, queue));
            }
        });
        Ok(Box::pin(events))
    }
}

/// Provider entry with fast retries, for use with a custom adapter.
pub fn provider(identity: &str) -> ProviderConfig {
    let mut p = ProviderConfig::new(
        identity,
        AdapterKind::OpenAi,
        "http://127.0.0.1:9/v1/chat/completions",
    );
    p.model = Some("test-model".into());
    p.retry.base_delay_ms = 1;
    p.retry.cap_ms = 5;
    p
}

/// Drain a receiver until the sender side closes or `timeout` passes.
pub async fn drain(rx: &mut mpsc::Receiver<StreamEvent>, timeout: Duration) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
    })
    .await;
    events
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Mockito server for wire-level adapter tests.
pub struct MockServerFixture {
    pub server: ServerGuard,
    pub base_url: String,
}

impl MockServerFixture {
    pub async fn new() -> Self {
        let server = Server::new_async().await;
        let base_url = server.url();
        Self { server, base_url }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Serve `frames` as one SSE body. Frames without a field name are sent
    /// as `data:` lines.
    pub async fn mock_sse(&mut self, path: &str, frames: &[&str]) -> Mock {
        let body = frames
            .iter()
            .map(|frame| {
                if frame.starts_with("data:") || frame.starts_with("event:") {
                    format!("{frame}\n\n")
                } else {
                    format!("data: {frame}\n\n")
                }
            })
            .collect::<String>();
        self.server
            .mock("POST", path)
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await
    }

    pub async fn mock_json(&mut self, path: &str, status: usize, body: &str) -> Mock {
        self.server
            .mock("POST", path)
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }
}
