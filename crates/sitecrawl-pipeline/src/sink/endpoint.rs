use reqwest::blocking::Client;
use serde::Serialize;

use crate::config::{EndpointSinkConfig, OnError};
use crate::record::CrawlRecord;
use crate::sink::{Sink, SinkError};

/// `{"urls":[]}`
const ENVELOPE_BYTES: usize = 11;

#[derive(Serialize)]
struct UrlBatch<'a> {
    urls: &'a [String],
}

/// Accumulates URLs and POSTs them as one JSON batch once the serialized
/// body grows past `max_bytes`.
pub struct EndpointSink {
    client: Client,
    url: String,
    max_bytes: usize,
    on_error: OnError,
    batch: Vec<String>,
    batch_bytes: usize,
    closed: bool,
}

impl EndpointSink {
    pub fn new(config: &EndpointSinkConfig) -> Result<Self, SinkError> {
        let url = config
            .url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| SinkError::Config("missing endpoint URL".into()))?;
        Ok(Self {
            client: Client::builder().build()?,
            url,
            max_bytes: config.max_bytes,
            on_error: config.on_error,
            batch: vec![],
            batch_bytes: ENVELOPE_BYTES,
            closed: false,
        })
    }

    /// URLs waiting for the next POST
    pub fn pending(&self) -> &[String] {
        &self.batch
    }

    /// Serialized size of the pending batch
    pub fn pending_bytes(&self) -> usize {
        self.batch_bytes
    }

    fn post_batch(&mut self) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let res = self
            .client
            .post(&self.url)
            .json(&UrlBatch { urls: &self.batch })
            .send()
            .and_then(|resp| resp.error_for_status());

        match res {
            Ok(_) => {
                log::info!("Posted {} URLs to {}", self.batch.len(), self.url);
                self.clear();
                Ok(())
            }
            Err(e) => match self.on_error {
                OnError::Fail => {
                    log::error!(
                        "Couldn't post {} URLs to {} got: {e}",
                        self.batch.len(),
                        self.url
                    );
                    Err(SinkError::Retained {
                        pending: self.batch.len(),
                        source: Box::new(e.into()),
                    })
                }
                OnError::SkipAndLog => {
                    log::error!(
                        "Dropping batch of {} URLs, couldn't post to {} got: {e}",
                        self.batch.len(),
                        self.url
                    );
                    self.clear();
                    Ok(())
                }
            },
        }
    }

    fn clear(&mut self) {
        self.batch.clear();
        self.batch_bytes = ENVELOPE_BYTES;
    }
}

impl Sink for EndpointSink {
    fn write(&mut self, record: &CrawlRecord) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        let separator = usize::from(!self.batch.is_empty());
        self.batch_bytes += serde_json::to_string(&record.url)?.len() + separator;
        self.batch.push(record.url.clone());

        if self.batch_bytes > self.max_bytes {
            self.post_batch()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.post_batch()?;
        self.closed = true;
        Ok(())
    }
}
