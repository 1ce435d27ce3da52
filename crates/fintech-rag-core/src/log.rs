//! Commit log seam between the sequencer and durable storage.
//!
//! The sequencer appends one [`CommitRecord`] per accepted event while it
//! still holds the sequencing lock, so the log is written in strict clock
//! order. An append failure aborts the submission before the clock value is
//! consumed.
//!
//! The core ships two implementations: [`NullLog`] (no durability) and
//! [`MemoryLog`] (records kept in memory, used by tests and tooling). The
//! JSON-lines write-ahead log lives in the application crate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::models::{DocId, Fields, LogicalClock};

/// Everything needed to re-apply one mutation on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub clock: LogicalClock,
    pub doc_id: DocId,
    pub source_id: String,
    pub external_id: String,
    pub content_hash: String,
    /// Empty for tombstones.
    #[serde(default = "empty_vector")]
    pub vector: Arc<[f32]>,
    #[serde(default)]
    pub fields: Fields,
    pub tombstone: bool,
    #[serde(default = "empty_text")]
    pub payload_text: Arc<str>,
    pub observed_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    /// Wall-clock time the sequencer accepted the event.
    pub committed_at: DateTime<Utc>,
}

fn empty_vector() -> Arc<[f32]> {
    Arc::from(Vec::new())
}

fn empty_text() -> Arc<str> {
    Arc::from("")
}

/// Append-only sink for commit records.
///
/// Called synchronously inside the sequencer's critical section; keep
/// implementations short.
pub trait CommitLog: Send + Sync {
    fn append(&self, record: &CommitRecord) -> anyhow::Result<()>;

    /// Flush buffered records. Default: nothing buffered.
    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl CommitLog for NullLog {
    fn append(&self, _record: &CommitRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps records in memory in append order.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<CommitRecord>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CommitRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make subsequent appends fail, simulating an I/O error.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl CommitLog for MemoryLog {
    fn append(&self, record: &CommitRecord) -> anyhow::Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("memory log is set to fail");
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}
