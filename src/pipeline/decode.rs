//! SSE 帧解码器：把任意切分的字节块还原为完整的 SSE 帧。
//!
//! Server-sent-events frame decoder. Chunk boundaries from the network are
//! arbitrary: a frame, a line, or even a multi-byte UTF-8 sequence may be
//! split across chunks, so bytes are buffered until a blank line closes a frame.

use crate::error::ErrorContext;
use crate::{Error, Result};

/// One dispatched SSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    /// `event:` field, if present.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// `id:` field, if present.
    pub id: Option<String>,
}

impl SseFrame {
    /// The `[DONE]` sentinel used by OpenAI-compatible providers.
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
struct PendingFrame {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    touched: bool,
}

impl PendingFrame {
    fn take(&mut self) -> Option<SseFrame> {
        if !self.touched {
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        self.touched = false;
        if frame.data.is_empty() && frame.event.is_none() {
            return None;
        }
        Some(frame)
    }
}

/// Longest line accepted before the stream is treated as malformed.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Incremental SSE decoder.
#[derive(Debug)]
pub struct SseDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no line break.
    scanned: usize,
    max_line: usize,
    pending: PendingFrame,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            pending: PendingFrame::default(),
        }
    }

    fn line_too_long(&self, len: usize) -> Error {
        Error::protocol_with_context(
            format!("SSE line of {len} bytes exceeds the {} byte limit", self.max_line),
            ErrorContext::new().with_source("sse_decoder"),
        )
    }

    /// Feed one network chunk; returns every frame completed by it.
    ///
    /// Fails with `Error::Protocol` once a line grows past the limit.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        // Lines end at '\n'; a trailing '\r' is stripped. Splitting on bytes
        // keeps partial UTF-8 sequences intact in the buffer.
        let mut start = 0;
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if end - start > self.max_line {
                return Err(self.line_too_long(end - start));
            }
            let mut line = &self.buf[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            if let Some(frame) = self.on_line(&line) {
                frames.push(frame);
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_line {
            return Err(self.line_too_long(self.buf.len()));
        }
        Ok(frames)
    }

    /// Flush at end of input. A final frame without its blank line is still
    /// dispatched.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.scanned = 0;
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(frame) = self.on_line(&line) {
                return Some(frame);
            }
        }
        self.pending.take()
    }

    fn on_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.pending.take();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "event" => {
                self.pending.event = Some(value.to_string());
                self.pending.touched = true;
            }
            "data" => {
                self.pending.data.push(value.to_string());
                self.pending.touched = true;
            }
            "id" => {
                self.pending.id = Some(value.to_string());
                self.pending.touched = true;
            }
            // `retry:` and unknown fields are ignored
            _ => {}
        }
        None
    }
}
