use std::fmt::Write as _;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use url::Url;

use crate::config::IndexSinkConfig;
use crate::document::{convert_html, IndexDocument};
use crate::record::CrawlRecord;
use crate::sink::{Sink, SinkError};

/// Converts pages to index documents and bulk loads them, `batch_size` at a time.
///
/// Bulk calls run on a dedicated uploader thread fed through a channel, so
/// accumulation never waits on the network and batches reach the index in order,
/// one call at a time.
pub struct IndexSink {
    batch: Vec<IndexDocument>,
    batch_size: usize,
    tx_batch: Option<Sender<Vec<IndexDocument>>>,
    uploader: Option<JoinHandle<UploadStats>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub batches: usize,
    pub loaded: usize,
    pub failed: usize,
}

impl IndexSink {
    pub fn new(config: &IndexSinkConfig) -> Result<Self, SinkError> {
        let client = IndexClient::new(config)?;
        let (tx_batch, rx_batch) = unbounded::<Vec<IndexDocument>>();

        let uploader = thread::Builder::new()
            .name(format!("bulk-{}", config.index_name))
            .spawn(move || {
                let mut stats = UploadStats::default();
                let mut index_ready = false;
                for docs in rx_batch {
                    if !index_ready {
                        client.ensure_index();
                        index_ready = true;
                    }
                    stats.batches += 1;
                    match client.bulk(&docs) {
                        Ok(loaded) => {
                            log::info!("Loaded {loaded} records to {}", client.index_name);
                            stats.loaded += loaded;
                            stats.failed += docs.len() - loaded;
                        }
                        Err(e) => {
                            log::error!("Error in bulk upload of {} records: {e}", docs.len());
                            stats.failed += docs.len();
                        }
                    }
                }
                stats
            })?;

        Ok(Self {
            batch: Vec::with_capacity(config.batch_size),
            batch_size: config.batch_size.max(1),
            tx_batch: Some(tx_batch),
            uploader: Some(uploader),
        })
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    fn flush_batch(&mut self) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let docs = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        let tx = self.tx_batch.as_ref().ok_or(SinkError::Closed)?;
        if tx.send(docs).is_err() {
            log::error!("Bulk uploader stopped, batch lost");
        }
        Ok(())
    }

    /// Flushes, waits for queued bulk calls and reports what was loaded
    pub fn finish(&mut self) -> Result<UploadStats, SinkError> {
        self.flush_batch()?;
        drop(self.tx_batch.take().ok_or(SinkError::Closed)?);
        let stats = match self.uploader.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                log::error!("Bulk uploader panicked");
                UploadStats::default()
            }
            None => UploadStats::default(),
        };
        Ok(stats)
    }
}

impl Sink for IndexSink {
    fn write(&mut self, record: &CrawlRecord) -> Result<(), SinkError> {
        if self.tx_batch.is_none() {
            return Err(SinkError::Closed);
        }
        let html = record.content().unwrap_or_default();
        match convert_html(html, &record.url, record.domain_name.as_deref()) {
            Some(doc) => {
                self.batch.push(doc);
                if self.batch.len() >= self.batch_size {
                    self.flush_batch()?;
                }
            }
            None => log::warn!("Did not create index document for URL: {}", record.url),
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let stats = self.finish()?;
        log::info!(
            "Index sink closed: {} batches, {} loaded, {} failed",
            stats.batches,
            stats.loaded,
            stats.failed
        );
        Ok(())
    }

    fn requires_content(&self) -> bool {
        true
    }
}

/// Validates a comma separated host list. Each entry needs scheme, host and port.
pub fn parse_hosts(hosts: &str) -> Result<Vec<Url>, SinkError> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(|h| match Url::parse(h) {
            Ok(url) if url.host_str().is_some() && url.port().is_some() => Ok(url),
            _ => Err(SinkError::Config(format!("Invalid Elasticsearch URL: {h}"))),
        })
        .collect::<Result<Vec<_>, _>>()
        .and_then(|urls| {
            if urls.is_empty() {
                Err(SinkError::Config("no Elasticsearch host configured".into()))
            } else {
                Ok(urls)
            }
        })
}

struct IndexClient {
    client: Client,
    hosts: Vec<Url>,
    index_name: String,
    alias: String,
    username: String,
    password: String,
    shards: u32,
    replicas: u32,
}

impl IndexClient {
    fn new(config: &IndexSinkConfig) -> Result<Self, SinkError> {
        if config.index_name.trim().is_empty() {
            return Err(SinkError::Config("missing index name".into()));
        }
        Ok(Self {
            client: Client::builder()
                .danger_accept_invalid_certs(true)
                .build()?,
            hosts: parse_hosts(&config.hosts)?,
            index_name: config.index_name.clone(),
            alias: config.alias.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            shards: config.shards,
            replicas: config.replicas,
        })
    }

    fn request(&self, method: Method, host: &Url, path: &str) -> RequestBuilder {
        let url = format!("{}/{path}", host.as_str().trim_end_matches('/'));
        let req = self.client.request(method, url);
        if self.username.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }

    /// Tries each host in turn until one answers
    fn send<F>(&self, build: F) -> Result<reqwest::blocking::Response, SinkError>
    where
        F: Fn(&Url) -> RequestBuilder,
    {
        let mut last_err = None;
        for host in &self.hosts {
            match build(host).send() {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    log::warn!("Elasticsearch host {host} unreachable: {e}");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None => Err(SinkError::Config("no Elasticsearch host configured".into())),
        }
    }

    fn ensure_index(&self) {
        let res = self
            .send(|host| self.request(Method::HEAD, host, &self.index_name))
            .and_then(|resp| {
                if resp.status() != StatusCode::NOT_FOUND {
                    resp.error_for_status()?;
                    log::info!("Index '{}' already exists.", self.index_name);
                    return Ok(());
                }
                let mut body = json!({
                    "settings": {
                        "index": {
                            "number_of_shards": self.shards,
                            "number_of_replicas": self.replicas,
                        }
                    }
                });
                if !self.alias.is_empty() {
                    let mut aliases = serde_json::Map::new();
                    aliases.insert(self.alias.clone(), json!({}));
                    body["aliases"] = Value::Object(aliases);
                }
                self.send(|host| self.request(Method::PUT, host, &self.index_name).json(&body))?
                    .error_for_status()?;
                log::info!("Index '{}' created successfully.", self.index_name);
                Ok(())
            });
        if let Err(e) = res {
            log::error!("Error creating/checking index: {e}");
        }
    }

    /// Returns how many documents were indexed
    fn bulk(&self, docs: &[IndexDocument]) -> Result<usize, SinkError> {
        let mut body = String::new();
        for doc in docs {
            let action = json!({ "index": { "_index": self.index_name, "_id": doc.id } });
            writeln!(body, "{action}").ok();
            writeln!(body, "{}", doc.to_source()).ok();
        }

        let resp: Value = self
            .send(|host| {
                self.request(Method::POST, host, "_bulk")
                    .header(CONTENT_TYPE, "application/x-ndjson")
                    .body(body.clone())
            })?
            .error_for_status()?
            .json()?;

        let failed = resp["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item["index"]["error"].is_object())
                    .count()
            })
            .unwrap_or(0);
        Ok(docs.len().saturating_sub(failed))
    }
}
