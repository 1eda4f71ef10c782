//! Pipeline execution: the per-run state machine plus the process and store hooks
//! it delegates to.

pub mod hooks;
pub mod rate_limiter;
pub mod retry;
pub mod runner;
pub mod sink;

pub use hooks::{
    Annotator, ContentExtractor, DocumentProcessor, ExtractedContent, ItemProcessor, ItemStore,
    KeywordAnnotator, PassthroughProcessor, ProcessorSpec, TextFieldExtractor, build_processor,
};
pub use rate_limiter::RateLimiter;
pub use retry::{MAX_BACKOFF, RetryPolicy};
pub use runner::{Checkpoint, Pipeline, PipelineSettings, RunOptions};
pub use sink::{DiscardSink, JsonlSink, SinkSpec, SqliteSink, build_sink};
