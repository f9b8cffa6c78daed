use std::io;

use crate::config::PipelineConfig;
use crate::record::{CrawlRecord, OutputTarget};

mod endpoint;
mod file;
mod index;

pub use endpoint::EndpointSink;
pub use file::FileSink;
pub use index::{parse_hosts, IndexSink, UploadStats};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid sink configuration: {0}")]
    Config(String),
    #[error("sink is already closed")]
    Closed,
    /// The batch holding the record couldn't be sent but is kept for the next attempt
    #[error("{pending} records kept after a failed delivery: {source}")]
    Retained {
        pending: usize,
        source: Box<SinkError>,
    },
}

impl SinkError {
    /// Whether the record being written was accepted despite the error
    pub fn is_retained(&self) -> bool {
        matches!(self, Self::Retained { .. })
    }
}

/// A delivery target owned by exactly one job.
pub trait Sink: Send {
    fn write(&mut self, record: &CrawlRecord) -> Result<(), SinkError>;

    /// Flushes whatever is still buffered. Called once at job end.
    fn close(&mut self) -> Result<(), SinkError>;

    fn requires_content(&self) -> bool {
        false
    }
}

pub fn open_sink(target: OutputTarget, config: &PipelineConfig) -> Result<Box<dyn Sink>, SinkError> {
    let sink: Box<dyn Sink> = match target {
        OutputTarget::Csv => Box::new(FileSink::create(config.file.clone())?),
        OutputTarget::Endpoint => Box::new(EndpointSink::new(&config.endpoint)?),
        OutputTarget::Elasticsearch => Box::new(IndexSink::new(&config.index)?),
    };
    Ok(sink)
}
