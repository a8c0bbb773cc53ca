//! Server-Sent-Events framing for incremental chat replies.
//!
//! Every frame is `data: <payload>\n\n`. A payload is either a JSON
//! [`ChatStreamChunk`], a JSON [`StreamFailure`] (recognised by its `error`
//! field), or the literal terminator `[DONE]`.

use crate::error::ApiClientError;
use crate::session::ToolCall;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use thiserror::Error;
use uuid::Uuid;

const DONE_SENTINEL: &str = "[DONE]";

/// One incremental reply fragment as sent by `/api/chat/stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

impl ChatStreamChunk {
    pub fn text(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            is_streaming: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamFailure {
    pub error: String,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default = "StreamFailure::streaming")]
    pub is_streaming: bool,
}

impl StreamFailure {
    pub fn new(error: impl Into<String>, session_id: Option<Uuid>) -> Self {
        Self {
            error: error.into(),
            session_id,
            is_streaming: true,
        }
    }

    fn streaming() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(ChatStreamChunk),
    Done,
    Error(StreamFailure),
}

impl StreamEvent {
    /// Decodes one frame payload. The only place the terminator literal is
    /// compared.
    pub fn parse(payload: &str) -> Result<Self, SseError> {
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            return Ok(Self::Done);
        }
        let value: Value = serde_json::from_str(payload).map_err(|err| SseError::Parse {
            details: err.to_string(),
            payload: payload.to_owned(),
        })?;
        let is_failure = value
            .get("error")
            .map(|error| !error.is_null())
            .unwrap_or(false);
        let parsed = if is_failure {
            serde_json::from_value(value).map(Self::Error)
        } else {
            serde_json::from_value(value).map(Self::Chunk)
        };
        parsed.map_err(|err| SseError::Parse {
            details: err.to_string(),
            payload: payload.to_owned(),
        })
    }

    pub fn payload(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Chunk(chunk) => serde_json::to_string(chunk),
            Self::Done => Ok(DONE_SENTINEL.to_owned()),
            Self::Error(failure) => serde_json::to_string(failure),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SseError {
    #[error("malformed stream frame: {details}")]
    Parse { details: String, payload: String },
    #[error("stream frame is not valid UTF-8")]
    Utf8,
    #[error("stream interrupted: {0}")]
    Transport(String),
}

impl From<SseError> for ApiClientError {
    fn from(err: SseError) -> Self {
        match err {
            SseError::Transport(message) => ApiClientError::network(message),
            other => ApiClientError::api(other.to_string(), None),
        }
    }
}

pub fn encode_frame(event: &StreamEvent) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", event.payload()?))
}

fn failure_frame(error: impl Into<String>, session_id: Option<Uuid>) -> String {
    let failure = StreamFailure::new(error, session_id);
    encode_frame(&StreamEvent::Error(failure)).unwrap_or_else(|_| {
        "data: {\"error\":\"stream failure\",\"isStreaming\":true}\n\n".to_owned()
    })
}

/// Producer side: one frame per fragment, then exactly one terminator or
/// exactly one failure frame. Every item is a complete frame.
pub fn event_stream<S, E>(fragments: S, session_id: Option<Uuid>) -> impl Stream<Item = String>
where
    S: Stream<Item = Result<ChatStreamChunk, E>> + Unpin,
    E: Display,
{
    stream::unfold(Some(fragments), move |state| async move {
        let mut fragments = state?;
        match fragments.next().await {
            Some(Ok(chunk)) => match encode_frame(&StreamEvent::Chunk(chunk)) {
                Ok(frame) => Some((frame, Some(fragments))),
                Err(err) => Some((failure_frame(err.to_string(), session_id), None)),
            },
            Some(Err(err)) => {
                tracing::error!(%err, "streaming reply failed");
                Some((failure_frame(err.to_string(), session_id), None))
            }
            None => Some((format!("data: {DONE_SENTINEL}\n\n"), None)),
        }
    })
}

/// Consumer side: incremental frame splitter.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the terminator has been decoded; later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<StreamEvent, SseError>> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some((end, consumed)) = frame_boundary(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..consumed).take(end).collect();
            if let Some(event) = decode_frame(&frame) {
                let done = matches!(event, Ok(StreamEvent::Done));
                events.push(event);
                if done {
                    self.finish_stream();
                    break;
                }
            }
        }
        events
    }

    /// Flushes a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<Result<StreamEvent, SseError>> {
        if self.finished {
            return None;
        }
        let frame = std::mem::take(&mut self.buffer);
        let event = decode_frame(&frame);
        if matches!(event, Some(Ok(StreamEvent::Done))) {
            self.finish_stream();
        }
        event
    }

    fn finish_stream(&mut self) {
        self.finished = true;
        self.buffer.clear();
    }
}

/// Returns (frame length, bytes to consume including the separator).
fn frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|at| (at, at + 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|at| (at, at + 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn decode_frame(frame: &[u8]) -> Option<Result<StreamEvent, SseError>> {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text,
        Err(_) => return Some(Err(SseError::Utf8)),
    };
    let mut data = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(StreamEvent::parse(&data.join("\n")))
}

/// Decodes a byte stream into events. Once `Done` has been yielded the source
/// is never polled again.
pub fn decode_stream<S, E>(source: S) -> impl Stream<Item = Result<StreamEvent, SseError>>
where
    S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
    E: Display,
{
    struct State<S> {
        source: S,
        decoder: SseDecoder,
        ready: VecDeque<Result<StreamEvent, SseError>>,
        exhausted: bool,
    }

    let state = State {
        source,
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((event, state));
            }
            if state.exhausted || state.decoder.is_finished() {
                return None;
            }
            match state.source.next().await {
                Some(Ok(bytes)) => state.ready.extend(state.decoder.push(&bytes)),
                Some(Err(err)) => {
                    state.exhausted = true;
                    state.ready.push_back(Err(SseError::Transport(err.to_string())));
                }
                None => {
                    state.exhausted = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn chunks(frames: &[&str]) -> Vec<Result<Vec<u8>, String>> {
        frames.iter().map(|f| Ok(f.as_bytes().to_vec())).collect()
    }

    #[tokio::test]
    async fn producer_emits_fragments_then_one_terminator() {
        let fragments = stream::iter(vec![
            Ok::<_, String>(ChatStreamChunk::text("Hel")),
            Ok(ChatStreamChunk::text("lo")),
        ]);
        let frames: Vec<String> = event_stream(fragments, None).collect().await;

        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with("data: {"));
        assert!(frames.iter().all(|frame| frame.ends_with("\n\n")));
        assert_eq!(frames[2], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn producer_emits_one_failure_frame_and_stops() {
        let session_id = Uuid::new_v4();
        let fragments = stream::iter(vec![
            Ok(ChatStreamChunk::text("partial")),
            Err("provider went away".to_string()),
            Ok(ChatStreamChunk::text("never sent")),
        ]);
        let frames: Vec<String> = event_stream(fragments, Some(session_id)).collect().await;

        assert_eq!(frames.len(), 2);
        let payload = frames[1]
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap();
        let json: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(json["error"], "provider went away");
        assert_eq!(json["sessionId"], session_id.to_string());
        assert_eq!(json["isStreaming"], true);
        assert!(!frames.iter().any(|frame| frame.contains("[DONE]")));
    }

    #[test]
    fn decoder_handles_frames_split_across_reads() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"reply\":\"He").is_empty());
        let events = decoder.push(b"llo\"}\n\ndata: {\"reply\":\" world\"}\n");
        assert_eq!(events.len(), 1);
        let events = decoder.push(b"\n");
        assert_eq!(
            events,
            vec![Ok(StreamEvent::Chunk(ChatStreamChunk {
                reply: Some(" world".into()),
                ..ChatStreamChunk::default()
            }))]
        );
    }

    #[test]
    fn decoder_ignores_comments_and_joins_data_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\n\nevent: message\r\ndata: {\"reply\":\r\ndata: \"x\"}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Ok(StreamEvent::Chunk(chunk)) if chunk.reply.as_deref() == Some("x")
        ));
    }

    #[test]
    fn error_envelope_is_recognised() {
        let event = StreamEvent::parse(r#"{"error":"rate limited","isStreaming":true}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Error(StreamFailure::new("rate limited", None))
        );
    }

    #[test]
    fn malformed_frame_does_not_poison_the_next_one() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {not json\n\ndata: {\"reply\":\"ok\"}\n\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Err(SseError::Parse { .. })));
        assert!(events[1].is_ok());
    }

    #[test]
    fn decoder_discards_everything_after_done() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: [DONE]\n\ndata: {\"reply\":\"late\"}\n\n");
        assert_eq!(events, vec![Ok(StreamEvent::Done)]);
        assert!(decoder.is_finished());
        assert!(decoder.push(b"data: {\"reply\":\"later\"}\n\n").is_empty());
        assert!(decoder.finish().is_none());
    }

    #[tokio::test]
    async fn consumer_stops_polling_after_done() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = polled.clone();
        let source = stream::iter(chunks(&[
            "data: {\"reply\":\"a\"}\n\n",
            "data: [DONE]\n\n",
            "data: {\"reply\":\"after\"}\n\n",
        ]))
        .inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let events: Vec<_> = decode_stream(source).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Ok(StreamEvent::Done));
        assert_eq!(polled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transport_break_mid_stream_surfaces_once() {
        let source = stream::iter(vec![
            Ok(b"data: {\"reply\":\"a\"}\n\ndata: {\"rep".to_vec()),
            Err("connection reset".to_string()),
        ]);
        let events: Vec<_> = decode_stream(source).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            Err(SseError::Transport("connection reset".into()))
        );
    }

    #[tokio::test]
    async fn produced_frames_round_trip_through_the_consumer() {
        let fragments = stream::iter(vec![
            Ok::<_, String>(ChatStreamChunk::text("one")),
            Ok(ChatStreamChunk::text("two")),
        ]);
        let bytes: Vec<Result<Vec<u8>, String>> = event_stream(fragments, None)
            .map(|frame| Ok(frame.into_bytes()))
            .collect()
            .await;
        let events: Vec<_> = decode_stream(stream::iter(bytes)).collect().await;

        let replies: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Ok(StreamEvent::Chunk(chunk)) => chunk.reply.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(replies, vec!["one", "two"]);
        assert_eq!(events.last(), Some(&Ok(StreamEvent::Done)));
    }
}
