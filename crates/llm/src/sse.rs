//! Server-sent-event decoding for streamed completions.
//!
//! [`SseDecoder`] is an incremental, line-oriented parser: bytes are pushed
//! in whatever pieces the network delivers and complete `data:` payloads
//! come out. [`decode_chunks`] layers it over an HTTP body stream.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};

use crate::api::{ChatCompletionChunk, UpstreamError};

/// Maximum bytes buffered without a line terminator (1 MB).
pub const MAX_SSE_BUFFER_SIZE: usize = 1024 * 1024;

/// Payload marking the end of an OpenAI-style stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Incremental SSE parser yielding the joined `data:` payload of each event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `chunk`; returns the payloads of every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, UpstreamError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.take_line(line) {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_SSE_BUFFER_SIZE {
            return Err(UpstreamError::Stream(format!(
                "event stream line exceeded {MAX_SSE_BUFFER_SIZE} bytes"
            )));
        }
        Ok(events)
    }

    /// Flush an event left unterminated when the stream closed.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = String::from_utf8_lossy(&rest).into_owned();
            if let Some(event) = self.take_line(rest.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn take_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // Comments (`:`) and other fields (`event:`, `id:`, `retry:`) carry
        // nothing the relay needs.
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}

/// Interpret one event payload. `Ok(None)` marks the end of the stream.
pub fn parse_event(data: &str) -> Result<Option<ChatCompletionChunk>, UpstreamError> {
    if data.trim() == DONE_SENTINEL {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| UpstreamError::Stream(format!("malformed stream event: {e}")))?;

    if let Some(error) = value.get("error") {
        let message = error
            .as_str()
            .or_else(|| error.get("message").and_then(|m| m.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(UpstreamError::Stream(message));
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| UpstreamError::Stream(format!("unexpected stream event: {e}")))
}

struct DecodeState<E> {
    body: BoxStream<'static, Result<Bytes, E>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    finished: bool,
}

/// Decode an SSE body into completion chunks.
///
/// The stream ends after `[DONE]`, at end of body, or right after the first
/// error it yields.
pub fn decode_chunks<S, E>(body: S) -> impl Stream<Item = Result<ChatCompletionChunk, UpstreamError>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<UpstreamError> + Send + 'static,
{
    let state = DecodeState {
        body: body.boxed(),
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(data) = state.ready.pop_front() {
                match parse_event(&data) {
                    Ok(Some(chunk)) => return Some((Ok(chunk), state)),
                    Ok(None) => {
                        state.finished = true;
                        return None;
                    }
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }

            match state.body.next().await {
                Some(Ok(bytes)) => match state.decoder.push(&bytes) {
                    Ok(events) => state.ready.extend(events),
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                },
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e.into()), state));
                }
                None => match state.decoder.finish() {
                    Some(data) => state.ready.push_back(data),
                    None => {
                        state.finished = true;
                        return None;
                    }
                },
            }
        }
    })
}
