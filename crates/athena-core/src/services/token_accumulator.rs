use thiserror::Error;

use super::markdown_renderer::render_markdown_html;

/// Fragments between throttled re-renders
pub const DEFAULT_RENDER_BATCH_SIZE: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccumulatorError {
    #[error("Reply has already been finalized")]
    AlreadyFinalized,
}

/// A throttled re-render of the reply so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTick {
    pub text: String,
    pub html: String,
    pub fragment_count: usize,
}

/// The completed reply, rendered once from the full buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedReply {
    pub text: String,
    pub html: String,
    pub fragment_count: usize,
}

/// Append-only buffer for one reply stream.
///
/// Re-renders every `batch_size` fragments, or immediately when a fragment
/// carries a newline. `finish` renders the whole buffer exactly once.
pub struct TokenAccumulator {
    buffer: String,
    fragment_count: usize,
    batch_size: usize,
    finalized: bool,
}

impl TokenAccumulator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: String::new(),
            fragment_count: 0,
            batch_size: batch_size.max(1),
            finalized: false,
        }
    }

    /// Append a fragment, returning a render when the throttle allows one.
    /// Fragments pushed after `finish` are ignored.
    pub fn push(&mut self, fragment: &str) -> Option<RenderTick> {
        if self.finalized {
            return None;
        }

        self.buffer.push_str(fragment);
        self.fragment_count += 1;

        let batch_boundary = self.fragment_count % self.batch_size == 0;
        if !batch_boundary && !fragment.contains('\n') {
            return None;
        }

        Some(RenderTick {
            text: self.buffer.clone(),
            html: render_markdown_html(&self.buffer),
            fragment_count: self.fragment_count,
        })
    }

    pub fn finish(&mut self) -> Result<FinalizedReply, AccumulatorError> {
        if self.finalized {
            return Err(AccumulatorError::AlreadyFinalized);
        }
        self.finalized = true;

        Ok(FinalizedReply {
            html: render_markdown_html(&self.buffer),
            text: std::mem::take(&mut self.buffer),
            fragment_count: self.fragment_count,
        })
    }

    /// Text of a stream that never finalized; `None` when nothing arrived
    pub fn into_partial(self) -> Option<String> {
        if self.finalized || self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer)
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }
}

impl Default for TokenAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_RENDER_BATCH_SIZE)
    }
}
