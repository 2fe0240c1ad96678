//! Reader for the assistant reply stream.
//!
//! The reply endpoint answers with an event-stream body: `data: {"delta": "..."}`
//! lines carrying text fragments, terminated by `data: [DONE]`. This module
//! frames raw bytes into lines, classifies each line, and provides the
//! `ReplySource` seam used to open the stream.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::repositories::{BoxFuture, SharedHttpClient};

/// Raw body chunks as they arrive from the transport
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Classified stream lines
pub type EventStream = BoxStream<'static, Result<StreamEvent, StreamError>>;

/// Prefix marking a significant line
pub const DATA_PREFIX: &str = "data:";

/// Payload signalling that no further fragments follow
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Failed to connect to stream: {message}")]
    Connection { status: Option<u16>, message: String },

    #[error("Stream transport failed: {0}")]
    Transport(String),
}

/// One significant line of the reply stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text fragment
    Delta(String),
    /// Terminal marker
    Done,
    /// A data line whose payload could not be understood
    Malformed(String),
}

#[derive(Deserialize)]
struct DeltaPayload {
    delta: String,
}

#[derive(Serialize)]
struct StreamRequest<'a> {
    query: &'a str,
}

/// Classify one line. Lines without the data prefix carry no event.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();

    if payload == DONE_MARKER {
        return Some(StreamEvent::Done);
    }

    match serde_json::from_str::<DeltaPayload>(payload) {
        Ok(parsed) => Some(StreamEvent::Delta(parsed.delta)),
        Err(_) => Some(StreamEvent::Malformed(payload.to_string())),
    }
}

/// Splits a byte stream into lines, carrying a partial line over to the next chunk
#[derive(Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed (empty lines skipped)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            if let Some(line) = Self::decode(&raw[..pos]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush a trailing line that was never newline-terminated
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buf.split();
        Self::decode(&rest)
    }

    fn decode(raw: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim_end_matches('\r');
        if text.trim().is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }
}

/// Turn raw body chunks into classified events.
///
/// Transport errors are forwarded and end the stream. Events after the
/// terminal marker are not produced.
pub fn read_events(mut bytes: ByteStream) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut decoder = LineDecoder::new();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for line in decoder.push(&chunk) {
                        if let Some(event) = parse_line(&line) {
                            let done = event == StreamEvent::Done;
                            yield Ok(event);
                            if done {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(event) = decoder.finish().as_deref().and_then(parse_line) {
            yield Ok(event);
        }
    })
}

/// Opens the reply stream for a query in a conversation
pub trait ReplySource: Send + Sync + 'static {
    fn open(
        &self,
        conversation_id: &str,
        query: &str,
    ) -> BoxFuture<'static, Result<ByteStream, StreamError>>;
}

/// Reply source backed by `POST /api/chat/{id}/streammsg`
pub struct HttpReplySource {
    base_url: String,
    http: SharedHttpClient,
}

impl HttpReplySource {
    pub fn new(base_url: impl Into<String>, http: SharedHttpClient) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }
}

impl ReplySource for HttpReplySource {
    fn open(
        &self,
        conversation_id: &str,
        query: &str,
    ) -> BoxFuture<'static, Result<ByteStream, StreamError>> {
        let url = format!("{}/api/chat/{}/streammsg", self.base_url, conversation_id);
        let query = query.to_string();
        let http = self.http.clone();

        Box::pin(async move {
            let client = http.client().map_err(|e| StreamError::Connection {
                status: None,
                message: e.to_string(),
            })?;

            let response = client
                .post(&url)
                .json(&StreamRequest { query: &query })
                .send()
                .await
                .map_err(|e| StreamError::Connection {
                    status: None,
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(StreamError::Connection {
                    status: Some(status.as_u16()),
                    message: format!("HTTP {}: {}", status, body),
                });
            }

            debug!(url = %url, "Reply stream opened");

            let stream: ByteStream = Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|e| StreamError::Transport(e.to_string()))),
            );
            Ok(stream)
        })
    }
}
