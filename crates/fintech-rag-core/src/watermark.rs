//! Per-source staleness and watermark tracking.
//!
//! For every `source_id` the tracker records the last clock the sequencer
//! applied for it, the wall-clock time of that apply, and the source's own
//! timestamps. From these it derives:
//!
//! - **lag**: time since the source last had an event applied. A silent
//!   source's lag grows without bound.
//! - **visibility latency**: `applied_at − received_at` for each event,
//!   kept as an exponentially weighted moving average.
//! - **global watermark**: the minimum last-applied clock over all sources.
//!
//! Every update bumps a generation counter on a `watch` channel so waiting
//! queries wake as soon as anything changes.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::models::LogicalClock;

/// Smoothing factor of the visibility latency average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Tracked state of one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceWatermark {
    pub source_id: String,
    /// Clock of the source's most recently applied event.
    pub last_clock: LogicalClock,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
    pub applied: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub embedding_failures: u64,
    pub dropped: u64,
    /// Smoothed `applied_at − received_at`, in milliseconds.
    pub visibility_latency_ms: Option<f64>,
}

impl SourceWatermark {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            last_clock: LogicalClock::ZERO,
            last_applied_at: None,
            last_observed_at: None,
            last_received_at: None,
            applied: 0,
            duplicates: 0,
            rejected: 0,
            embedding_failures: 0,
            dropped: 0,
            visibility_latency_ms: None,
        }
    }

    /// Time since the last apply, measured at `now`. `None` if nothing from
    /// this source was ever applied.
    pub fn lag_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_applied_at
            .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Non-apply outcomes counted per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOutcome {
    Duplicate,
    Rejected,
    EmbeddingFailed,
    Dropped,
}

/// Thread-safe registry of [`SourceWatermark`]s.
#[derive(Debug)]
pub struct WatermarkTracker {
    sources: RwLock<HashMap<String, SourceWatermark>>,
    changes: watch::Sender<u64>,
}

impl Default for WatermarkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WatermarkTracker {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            sources: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Make a source known before it produces anything, so a silent source
    /// shows up in metrics and holds the global watermark at zero.
    pub fn register_source(&self, source_id: &str) {
        let mut sources = self.sources.write();
        if !sources.contains_key(source_id) {
            sources.insert(source_id.to_string(), SourceWatermark::new(source_id));
            drop(sources);
            self.notify();
        }
    }

    /// Record that an event of `source_id` was applied at `clock`.
    pub fn record_applied(
        &self,
        source_id: &str,
        clock: LogicalClock,
        observed_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
        applied_at: DateTime<Utc>,
    ) {
        {
            let mut sources = self.sources.write();
            let entry = sources
                .entry(source_id.to_string())
                .or_insert_with(|| SourceWatermark::new(source_id));
            entry.last_clock = entry.last_clock.max(clock);
            entry.last_applied_at = Some(entry.last_applied_at.map_or(applied_at, |t| t.max(applied_at)));
            entry.last_observed_at = Some(entry.last_observed_at.map_or(observed_at, |t| t.max(observed_at)));
            entry.last_received_at = Some(entry.last_received_at.map_or(received_at, |t| t.max(received_at)));
            entry.applied += 1;

            let sample = (applied_at - received_at).num_milliseconds().max(0) as f64;
            entry.visibility_latency_ms = Some(match entry.visibility_latency_ms {
                None => sample,
                Some(prev) => prev + LATENCY_EWMA_ALPHA * (sample - prev),
            });
        }
        self.notify();
    }

    /// Count a non-apply outcome.
    pub fn record_outcome(&self, source_id: &str, outcome: SourceOutcome) {
        let mut sources = self.sources.write();
        let entry = sources
            .entry(source_id.to_string())
            .or_insert_with(|| SourceWatermark::new(source_id));
        match outcome {
            SourceOutcome::Duplicate => entry.duplicates += 1,
            SourceOutcome::Rejected => entry.rejected += 1,
            SourceOutcome::EmbeddingFailed => entry.embedding_failures += 1,
            SourceOutcome::Dropped => entry.dropped += 1,
        }
    }

    pub fn get(&self, source_id: &str) -> Option<SourceWatermark> {
        self.sources.read().get(source_id).cloned()
    }

    /// Time since `source_id` last had an event applied.
    pub fn lag(&self, source_id: &str) -> Option<Duration> {
        self.lag_at(source_id, Utc::now())
    }

    pub fn lag_at(&self, source_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.sources.read().get(source_id)?.lag_at(now)
    }

    /// Minimum last-applied clock over all known sources.
    pub fn global_watermark(&self) -> Option<LogicalClock> {
        self.sources.read().values().map(|s| s.last_clock).min()
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All sources, ordered by id.
    pub fn all(&self) -> BTreeMap<String, SourceWatermark> {
        self.sources
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Receiver whose value changes on every update.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}
