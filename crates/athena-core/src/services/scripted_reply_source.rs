use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;

use super::stream_reader::{ByteStream, ReplySource, StreamError};
use crate::repositories::BoxFuture;

/// How one `open` call is answered
#[derive(Debug, Clone)]
pub enum ReplyScript {
    /// Body chunks, then a clean close
    Chunks(Vec<Bytes>),
    /// Connection refused with this HTTP status
    Status(u16),
    /// Body chunks, then a transport failure
    ChunksThenError(Vec<Bytes>, String),
    /// Body chunks, then the connection stays open without data
    Pending(Vec<Bytes>),
}

impl ReplyScript {
    /// Build a well-formed reply from text fragments, one chunk per fragment,
    /// closed with the terminal marker
    pub fn fragments(fragments: &[&str]) -> Self {
        let mut chunks: Vec<Bytes> = fragments
            .iter()
            .map(|f| Bytes::from(format!("data: {}\n\n", serde_json::json!({ "delta": f }))))
            .collect();
        chunks.push(Bytes::from_static(b"data: [DONE]\n\n"));
        ReplyScript::Chunks(chunks)
    }

    /// Raw body split into the given chunks
    pub fn raw(chunks: &[&str]) -> Self {
        ReplyScript::Chunks(chunks.iter().map(|c| Bytes::from(c.to_string())).collect())
    }
}

/// Reply source that plays back queued scripts in order.
///
/// Records every `(conversation_id, query)` it was opened with.
#[derive(Default)]
pub struct ScriptedReplySource {
    scripts: Mutex<VecDeque<ReplyScript>>,
    opened: Mutex<Vec<(String, String)>>,
}

impl ScriptedReplySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: ReplyScript) {
        self.scripts.lock().push_back(script);
    }

    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().clone()
    }
}

fn ok_chunks(chunks: Vec<Bytes>) -> impl futures::Stream<Item = Result<Bytes, StreamError>> {
    stream::iter(chunks.into_iter().map(Ok))
}

impl ReplySource for ScriptedReplySource {
    fn open(
        &self,
        conversation_id: &str,
        query: &str,
    ) -> BoxFuture<'static, Result<ByteStream, StreamError>> {
        self.opened
            .lock()
            .push((conversation_id.to_string(), query.to_string()));
        let script = self.scripts.lock().pop_front();

        Box::pin(async move {
            use futures::StreamExt;

            match script {
                None => Err(StreamError::Connection {
                    status: None,
                    message: "no scripted reply queued".to_string(),
                }),
                Some(ReplyScript::Status(status)) => Err(StreamError::Connection {
                    status: Some(status),
                    message: format!("HTTP {}", status),
                }),
                Some(ReplyScript::Chunks(chunks)) => {
                    let stream: ByteStream = Box::pin(ok_chunks(chunks));
                    Ok(stream)
                }
                Some(ReplyScript::ChunksThenError(chunks, message)) => {
                    let stream: ByteStream = Box::pin(
                        ok_chunks(chunks).chain(stream::once(async move {
                            Err(StreamError::Transport(message))
                        })),
                    );
                    Ok(stream)
                }
                Some(ReplyScript::Pending(chunks)) => {
                    let stream: ByteStream =
                        Box::pin(ok_chunks(chunks).chain(stream::pending()));
                    Ok(stream)
                }
            }
        })
    }
}
