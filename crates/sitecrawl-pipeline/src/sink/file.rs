use std::io::{BufWriter, Write};
use std::path::PathBuf;

use fs_err as fs;

use crate::config::FileSinkConfig;
use crate::record::CrawlRecord;
use crate::sink::{Sink, SinkError};

/// One URL per line. Crossing `max_bytes` moves the current file aside as
/// `<stem>-<n>.<ext>` and starts over under the original name.
pub struct FileSink {
    config: FileSinkConfig,
    wtr: Option<BufWriter<fs::File>>,
    current_size: usize,
    rotations: usize,
}

impl FileSink {
    pub fn create(config: FileSinkConfig) -> Result<Self, SinkError> {
        fs::create_dir_all(&config.directory)?;
        let wtr = BufWriter::new(fs::File::create(config.base_path())?);
        Ok(Self {
            config,
            wtr: Some(wtr),
            current_size: 0,
            rotations: 0,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.config.base_path()
    }

    /// Every file written so far, rotated ones first
    pub fn files(&self) -> Vec<PathBuf> {
        (1..=self.rotations)
            .map(|n| self.config.rotated_path(n))
            .chain(Some(self.config.base_path()))
            .collect()
    }

    /// A failed rename keeps appending to the current file, the next attempt
    /// comes after another `max_bytes`.
    fn rotate(&mut self) -> Result<(), SinkError> {
        if let Some(wtr) = self.wtr.as_mut() {
            wtr.flush()?;
        }
        let base = self.config.base_path();
        let rotated = self.config.rotated_path(self.rotations + 1);
        match fs::rename(&base, &rotated) {
            Ok(()) => {
                self.rotations += 1;
                log::info!(
                    "Rotated {} ({} bytes) to {}",
                    base.display(),
                    self.current_size,
                    rotated.display()
                );
                self.wtr = Some(BufWriter::new(fs::File::create(&base)?));
            }
            Err(e) => {
                log::error!("Couldn't rotate, still writing to {}: {e}", base.display());
                let file = fs::OpenOptions::new().append(true).open(&base)?;
                self.wtr = Some(BufWriter::new(file));
            }
        }
        self.current_size = 0;
        Ok(())
    }
}

impl Sink for FileSink {
    fn write(&mut self, record: &CrawlRecord) -> Result<(), SinkError> {
        let line_len = record.url.len() + 1;
        if self.current_size > 0 && self.current_size + line_len > self.config.max_bytes {
            self.rotate()?;
        }
        let wtr = self.wtr.as_mut().ok_or(SinkError::Closed)?;
        if let Err(e) = writeln!(wtr, "{}", record.url) {
            log::error!("Couldn't write {} got: {e}", record.url);
            return Err(e.into());
        }
        self.current_size += line_len;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        match self.wtr.take() {
            Some(mut wtr) => {
                wtr.flush()?;
                log::info!(
                    "Closed {} after {} rotation(s)",
                    self.config.base_path().display(),
                    self.rotations
                );
                Ok(())
            }
            None => Err(SinkError::Closed),
        }
    }
}
