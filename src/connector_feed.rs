//! JSON-lines feed producer.
//!
//! Tails a file of [`SourceRecord`]s, one JSON object per line, the way
//! market-data, news and sanctions drops are usually landed on disk:
//!
//! ```text
//! {"kind":"market_tick","symbol":"AAPL","price":189.5,"ts":"2024-05-01T14:30:00Z"}
//! {"kind":"news_article","id":"n-1","headline":"Fed holds rates","published_at":"..."}
//! ```
//!
//! Each poll resumes at the byte offset where the previous one stopped. A
//! trailing line without its newline is left for the next poll, since the
//! writer may still be in the middle of it. Malformed lines are logged and
//! skipped. If the file shrinks below the saved offset it is assumed to have
//! been rotated and is read again from the start.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use fintech_rag_core::normalize::SourceRecord;

use crate::config::FeedSourceConfig;
use crate::traits::Producer;

/// Records parsed from a chunk of feed bytes.
#[derive(Debug, Default)]
pub struct FeedBatch {
    pub records: Vec<SourceRecord>,
    /// Bytes consumed, always ending on a line boundary.
    pub consumed: usize,
    pub malformed: usize,
}

/// Parse the complete lines of `bytes`. With `at_eof`, a final line without
/// a newline counts as complete.
pub fn parse_feed_lines(bytes: &[u8], at_eof: bool, origin: &str) -> FeedBatch {
    let mut batch = FeedBatch::default();
    let mut start = 0usize;

    while start < bytes.len() {
        let end = match bytes[start..].iter().position(|b| *b == b'\n') {
            Some(i) => start + i + 1,
            None if at_eof => bytes.len(),
            None => break,
        };
        let line = String::from_utf8_lossy(&bytes[start..end]);
        let line = line.trim();
        if !line.is_empty() {
            match serde_json::from_str::<SourceRecord>(line) {
                Ok(r) => batch.records.push(r),
                Err(e) => {
                    batch.malformed += 1;
                    tracing::warn!(source = origin, offset = start, error = %e, "skipping malformed feed line");
                }
            }
        }
        start = end;
    }

    batch.consumed = start;
    batch
}

/// Read a whole feed file at once (used by `frag ingest`).
pub fn read_feed_file(path: &Path) -> Result<FeedBatch> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read feed file: {}", path.display()))?;
    Ok(parse_feed_lines(&bytes, true, &path.display().to_string()))
}

pub struct FeedProducer {
    name: String,
    description: String,
    config: FeedSourceConfig,
    offset: Mutex<u64>,
}

impl FeedProducer {
    pub fn new(name: String, config: FeedSourceConfig) -> Self {
        let description = format!("JSON-lines feed at {}", config.path.display());
        Self {
            name,
            description,
            config,
            offset: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.config.path
    }

    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    fn read_new(&self) -> Result<Vec<SourceRecord>> {
        let path = &self.config.path;
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(source = %self.name, path = %path.display(), "feed file not present yet");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to open feed file: {}", path.display()))
            }
        };

        let len = file.metadata()?.len();
        let mut offset = self.offset.lock();
        if len < *offset {
            tracing::warn!(source = %self.name, path = %path.display(), "feed file shrank, rereading from start");
            *offset = 0;
        }
        if len == *offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(*offset))?;
        let mut bytes = Vec::with_capacity((len - *offset) as usize);
        file.read_to_end(&mut bytes)?;

        let batch = parse_feed_lines(&bytes, false, &self.name);
        *offset += batch.consumed as u64;
        if !batch.records.is_empty() {
            tracing::debug!(
                source = %self.name,
                records = batch.records.len(),
                offset = *offset,
                "feed poll"
            );
        }
        Ok(batch.records)
    }
}

#[async_trait]
impl Producer for FeedProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> &str {
        "feed"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    async fn poll(&self) -> Result<Vec<SourceRecord>> {
        self.read_new()
    }
}
