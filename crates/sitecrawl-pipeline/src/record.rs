use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One page emitted by a crawl worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlRecord {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub html_content: Option<String>,
    #[serde(default)]
    pub domain_name: Option<String>,
    /// Response `Content-Type` header, when the worker reports it
    #[serde(default)]
    pub content_type: Option<String>,
}

impl CrawlRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html_content = Some(html.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain_name = Some(domain.into());
        self
    }

    /// Non-blank html content, if any
    pub fn content(&self) -> Option<&str> {
        self.html_content
            .as_deref()
            .filter(|html| !html.trim().is_empty())
    }
}

/// Where a job delivers what it crawled. Exactly one per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OutputTarget {
    #[serde(alias = "file")]
    Csv,
    Endpoint,
    #[serde(alias = "search-index")]
    Elasticsearch,
}

impl OutputTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Endpoint => "endpoint",
            Self::Elasticsearch => "elasticsearch",
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputTarget {
    type Err = UnknownOutputTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" | "file" => Ok(Self::Csv),
            "endpoint" => Ok(Self::Endpoint),
            "elasticsearch" | "search-index" => Ok(Self::Elasticsearch),
            _ => Err(UnknownOutputTarget(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown output target `{0}`, expected one of: csv, endpoint, elasticsearch")]
pub struct UnknownOutputTarget(pub String);

/// Why a record never reached the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("item already seen")]
    Duplicate,
    #[error("missing URL in item")]
    MissingUrl,
    #[error("missing HTML content in item")]
    MissingContent,
    #[error("unsupported content type")]
    UnsupportedContentType,
}
