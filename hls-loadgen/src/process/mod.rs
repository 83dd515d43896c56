//! Child-process output plumbing: line splitting and the bounded,
//! drop-newest queue that keeps a slow parser from ever blocking the
//! worker it's reading from.

pub(crate) mod line_source;
pub(crate) mod pipeline;

pub use line_source::LineSource;
pub use pipeline::{BoundedLineQueue, ParserPipeline, PipelineCounters};
