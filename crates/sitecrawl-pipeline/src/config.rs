use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 3.9 MiB, the size limit shared by rotated files and endpoint batches.
pub const DEFAULT_MAX_BYTES: usize = 3_900 * 1_024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub dedup_key: DedupKey,

    #[serde(default)]
    pub file: FileSinkConfig,

    #[serde(default)]
    pub endpoint: EndpointSinkConfig,

    #[serde(default)]
    pub index: IndexSinkConfig,
}

/// What identifies a record as already delivered within one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum DedupKey {
    #[default]
    Url,
    ContentHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OnError {
    Fail,
    SkipAndLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSinkConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    #[serde(default = "default_stem")]
    pub stem: String,

    #[serde(default = "default_extension")]
    pub extension: String,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            stem: default_stem(),
            extension: default_extension(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl FileSinkConfig {
    pub fn base_path(&self) -> PathBuf {
        self.directory.join(format!("{}.{}", self.stem, self.extension))
    }

    pub fn rotated_path(&self, n: usize) -> PathBuf {
        self.directory.join(format!("{}-{n}.{}", self.stem, self.extension))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSinkConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    #[serde(default = "default_on_post_error")]
    pub on_error: OnError,
}

impl Default for EndpointSinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_bytes: default_max_bytes(),
            on_error: default_on_post_error(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSinkConfig {
    /// Comma separated `scheme://host:port` list
    #[serde(default)]
    pub hosts: String,

    #[serde(default)]
    pub index_name: String,

    #[serde(default)]
    pub alias: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_shards")]
    pub shards: u32,

    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

impl Default for IndexSinkConfig {
    fn default() -> Self {
        Self {
            hosts: String::new(),
            index_name: String::new(),
            alias: String::new(),
            username: String::new(),
            password: String::new(),
            batch_size: default_batch_size(),
            shards: default_shards(),
            replicas: default_replicas(),
        }
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_stem() -> String {
    format!("all-links-p{}", std::process::id())
}

fn default_extension() -> String {
    String::from("csv")
}

fn default_max_bytes() -> usize {
    DEFAULT_MAX_BYTES
}

fn default_on_post_error() -> OnError {
    OnError::Fail
}

fn default_batch_size() -> usize {
    50
}

fn default_shards() -> u32 {
    6
}

fn default_replicas() -> u32 {
    1
}
