//! Pull-based observability snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::embedding::{EmbeddingCacheStats, EmbeddingStage};
use crate::index::IndexStats;
use crate::models::LogicalClock;
use crate::normalize::Normalizer;
use crate::sequencer::Sequencer;
use crate::watermark::SourceWatermark;

/// One source's row in a [`MetricsSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceMetrics {
    #[serde(flatten)]
    pub watermark: SourceWatermark,
    /// Time since the last apply, in ms. `None` if never applied.
    pub lag_ms: Option<u64>,
}

/// Everything an operator needs to judge freshness and index health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub assigned_clock: LogicalClock,
    pub visible_clock: LogicalClock,
    pub global_watermark: Option<LogicalClock>,
    pub sources: BTreeMap<String, SourceMetrics>,
    pub index: IndexStats,
    pub embedding: EmbeddingCacheStats,
    pub pending_retries: usize,
}

impl MetricsSnapshot {
    pub fn collect(
        sequencer: &Sequencer,
        embedding: &EmbeddingStage,
        normalizer: &Normalizer,
    ) -> Self {
        let now = Utc::now();
        let watermarks = sequencer.watermarks();
        let sources = watermarks
            .all()
            .into_iter()
            .map(|(id, wm)| {
                let lag_ms = wm.lag_at(now).map(|d| d.as_millis() as u64);
                (id, SourceMetrics { watermark: wm, lag_ms })
            })
            .collect();
        Self {
            generated_at: now,
            assigned_clock: sequencer.assigned_clock(),
            visible_clock: sequencer.index().visible_clock(),
            global_watermark: watermarks.global_watermark(),
            sources,
            index: sequencer.index().stats(),
            embedding: embedding.cache_stats(),
            pending_retries: normalizer.pending_retries(),
        }
    }
}
