pub mod error_collector_layer;
pub mod markdown_renderer;
pub mod scripted_reply_source;
pub mod stream_reader;
pub mod token_accumulator;

pub use error_collector_layer::ErrorCollectorLayer;
pub use markdown_renderer::{render_markdown_html, strip_tags};
pub use scripted_reply_source::{ReplyScript, ScriptedReplySource};
pub use stream_reader::{
    ByteStream, EventStream, HttpReplySource, LineDecoder, ReplySource, StreamError, StreamEvent,
    parse_line, read_events,
};
pub use token_accumulator::{
    AccumulatorError, DEFAULT_RENDER_BATCH_SIZE, FinalizedReply, RenderTick, TokenAccumulator,
};
