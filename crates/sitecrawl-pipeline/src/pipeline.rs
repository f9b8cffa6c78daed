use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::config::{DedupKey, PipelineConfig};
use crate::record::{CrawlRecord, OutputTarget, RejectReason};
use crate::rules::is_valid_content_type;
use crate::sink::{open_sink, Sink, SinkError};

/// Identifiers delivered during one job. Never shared, never persisted.
#[derive(Debug, Default)]
pub struct SeenSet {
    key: DedupKey,
    seen: HashSet<String>,
}

impl SeenSet {
    pub fn new(key: DedupKey) -> Self {
        Self {
            key,
            seen: HashSet::new(),
        }
    }

    fn identify(&self, record: &CrawlRecord) -> Option<String> {
        match (self.key, record.content()) {
            (DedupKey::ContentHash, Some(html)) => Some(hex::encode(Sha256::digest(html))),
            _ if record.url.is_empty() => None,
            _ => Some(record.url.clone()),
        }
    }

    pub fn contains(&self, record: &CrawlRecord) -> bool {
        self.identify(record)
            .map_or(false, |id| self.seen.contains(&id))
    }

    /// `false` when the record was seen before
    pub fn insert(&mut self, record: &CrawlRecord) -> bool {
        match self.identify(record) {
            Some(id) => self.seen.insert(id),
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped(RejectReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records the sink accepted, including those still held in a batch
    /// whose last delivery attempt failed
    pub delivered: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Dedup, validation and delivery for one job, in that order.
pub struct Pipeline {
    seen: SeenSet,
    sink: Box<dyn Sink>,
    require_content: bool,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(sink: Box<dyn Sink>, dedup_key: DedupKey) -> Self {
        Self {
            seen: SeenSet::new(dedup_key),
            require_content: sink.requires_content(),
            sink,
            stats: PipelineStats::default(),
        }
    }

    pub fn open(target: OutputTarget, config: &PipelineConfig) -> Result<Self, SinkError> {
        let sink = open_sink(target, config)?;
        log::info!("Opened {target} pipeline");
        Ok(Self::new(sink, config.dedup_key))
    }

    /// A record only counts as seen once the sink accepted it, so a record
    /// whose write failed outright can be fed again.
    pub fn process(&mut self, record: CrawlRecord) -> Result<Delivery, SinkError> {
        if self.seen.contains(&record) {
            self.stats.duplicates += 1;
            log::debug!("Dropping {}: {}", record.url, RejectReason::Duplicate);
            return Ok(Delivery::Dropped(RejectReason::Duplicate));
        }

        if let Err(reason) = self.validate(&record) {
            self.stats.rejected += 1;
            log::debug!("Dropping {:?}: {reason}", record.url);
            return Ok(Delivery::Dropped(reason));
        }

        match self.sink.write(&record) {
            Ok(()) => {
                self.accept(&record);
                Ok(Delivery::Delivered)
            }
            Err(e) if e.is_retained() => {
                self.accept(&record);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn accept(&mut self, record: &CrawlRecord) {
        self.seen.insert(record);
        self.stats.delivered += 1;
    }

    fn validate(&self, record: &CrawlRecord) -> Result<(), RejectReason> {
        if record.url.trim().is_empty() {
            return Err(RejectReason::MissingUrl);
        }
        if self.require_content && record.content().is_none() {
            return Err(RejectReason::MissingContent);
        }
        if let Some(content_type) = &record.content_type {
            if !is_valid_content_type(content_type) {
                return Err(RejectReason::UnsupportedContentType);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Flushes the sink and ends the job's pipeline
    pub fn close(mut self) -> Result<PipelineStats, SinkError> {
        self.sink.close()?;
        log::info!(
            "Pipeline closed: {} delivered, {} duplicates, {} rejected",
            self.stats.delivered,
            self.stats.duplicates,
            self.stats.rejected
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default, Clone)]
    struct MemorySink {
        written: Arc<Mutex<Vec<String>>>,
        closes: Arc<Mutex<usize>>,
        content: bool,
    }

    impl Sink for MemorySink {
        fn write(&mut self, record: &CrawlRecord) -> Result<(), SinkError> {
            self.written.lock().unwrap().push(record.url.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<(), SinkError> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }

        fn requires_content(&self) -> bool {
            self.content
        }
    }

    #[test]
    fn same_url_is_delivered_once() {
        let sink = MemorySink::default();
        let mut pipeline = Pipeline::new(Box::new(sink.clone()), DedupKey::Url);

        let first = pipeline.process(CrawlRecord::new("http://example.com")).unwrap();
        let second = pipeline.process(CrawlRecord::new("http://example.com")).unwrap();

        assert_eq!(first, Delivery::Delivered);
        assert_eq!(second, Delivery::Dropped(RejectReason::Duplicate));
        assert_eq!(*sink.written.lock().unwrap(), vec!["http://example.com"]);
        assert_eq!(pipeline.seen().len(), 1);

        let stats = pipeline.close().unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(*sink.closes.lock().unwrap(), 1);
    }

    #[test]
    fn fresh_pipeline_has_clean_state() {
        let one = MemorySink::default();
        let two = MemorySink::default();
        let mut first = Pipeline::new(Box::new(one), DedupKey::Url);
        let mut second = Pipeline::new(Box::new(two), DedupKey::Url);

        let record = CrawlRecord::new("http://example.com/1");
        assert_eq!(first.process(record.clone()).unwrap(), Delivery::Delivered);
        assert_eq!(second.process(record).unwrap(), Delivery::Delivered);
    }

    #[test]
    fn missing_url_is_rejected() {
        let sink = MemorySink::default();
        let mut pipeline = Pipeline::new(Box::new(sink.clone()), DedupKey::Url);

        let outcome = pipeline.process(CrawlRecord::default()).unwrap();
        assert_eq!(outcome, Delivery::Dropped(RejectReason::MissingUrl));
        let outcome = pipeline.process(CrawlRecord::default()).unwrap();
        assert_eq!(outcome, Delivery::Dropped(RejectReason::MissingUrl));
        assert!(pipeline.seen().is_empty());
        assert!(sink.written.lock().unwrap().is_empty());
    }

    #[test]
    fn content_sinks_reject_empty_bodies() {
        let sink = MemorySink {
            content: true,
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(Box::new(sink.clone()), DedupKey::Url);

        let empty = CrawlRecord::new("http://example.com/a").with_html("   ");
        let full = CrawlRecord::new("http://example.com/b").with_html("<p>hi</p>");

        assert_eq!(
            pipeline.process(empty).unwrap(),
            Delivery::Dropped(RejectReason::MissingContent)
        );
        assert_eq!(pipeline.process(full).unwrap(), Delivery::Delivered);
        assert_eq!(pipeline.stats().rejected, 1);
    }

    #[test]
    fn content_hash_dedups_mirrors() {
        let sink = MemorySink::default();
        let mut pipeline = Pipeline::new(Box::new(sink.clone()), DedupKey::ContentHash);

        let a = CrawlRecord::new("http://example.com/a").with_html("<p>same</p>");
        let b = CrawlRecord::new("http://example.com/b").with_html("<p>same</p>");
        let c = CrawlRecord::new("http://example.com/c");

        assert_eq!(pipeline.process(a).unwrap(), Delivery::Delivered);
        assert_eq!(
            pipeline.process(b).unwrap(),
            Delivery::Dropped(RejectReason::Duplicate)
        );
        assert_eq!(pipeline.process(c).unwrap(), Delivery::Delivered);
    }

    /// Fails the first write outright, then accepts everything
    #[derive(Default)]
    struct FlakySink {
        failed: bool,
        written: Vec<String>,
    }

    impl Sink for FlakySink {
        fn write(&mut self, record: &CrawlRecord) -> Result<(), SinkError> {
            if !self.failed {
                self.failed = true;
                return Err(SinkError::Io(std::io::ErrorKind::Other.into()));
            }
            self.written.push(record.url.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn failed_write_can_be_retried() {
        let mut pipeline = Pipeline::new(Box::<FlakySink>::default(), DedupKey::Url);
        let record = CrawlRecord::new("http://example.com/a");

        assert!(matches!(
            pipeline.process(record.clone()),
            Err(SinkError::Io(_))
        ));
        assert!(pipeline.seen().is_empty());
        assert_eq!(pipeline.process(record).unwrap(), Delivery::Delivered);
        assert_eq!(pipeline.stats().delivered, 1);
    }

    #[test]
    fn unsupported_content_type_is_rejected() {
        let sink = MemorySink::default();
        let mut pipeline = Pipeline::new(Box::new(sink.clone()), DedupKey::Url);

        let image = CrawlRecord::new("http://example.com/logo").with_content_type("image/png");
        let page = CrawlRecord::new("http://example.com/page")
            .with_content_type("text/html; charset=utf-8");

        assert_eq!(
            pipeline.process(image).unwrap(),
            Delivery::Dropped(RejectReason::UnsupportedContentType)
        );
        assert_eq!(pipeline.process(page).unwrap(), Delivery::Delivered);
        assert_eq!(*sink.written.lock().unwrap(), vec!["http://example.com/page"]);
    }
}
