mod config;
mod document;
mod pipeline;
mod record;
mod rules;
mod scope;
pub mod sink;

pub use config::{
    DedupKey, EndpointSinkConfig, FileSinkConfig, IndexSinkConfig, OnError, PipelineConfig,
    DEFAULT_MAX_BYTES,
};
pub use document::{convert_html, sanitize_text, url_sha256, IndexDocument};
pub use pipeline::{Delivery, Pipeline, PipelineStats, SeenSet};
pub use record::{CrawlRecord, OutputTarget, RejectReason, UnknownOutputTarget};
pub use rules::{is_valid_content_type, LinkRejection, LinkRules};
pub use scope::{ScopeError, ScopeFilter};
pub use sink::{Sink, SinkError};
