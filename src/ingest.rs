//! Ingestion pipeline: source record → change events → vectors → sequencer.
//!
//! # Pipeline
//!
//! ```text
//! SourceRecord
//!   → Normalizer::normalize       (0..n ChangeEvents; invalid → Invalid)
//!   → EmbeddingStage::embed_event (upserts only; failure → retry ledger)
//!   → Sequencer::submit           (clock, commit log, index, watermarks)
//! ```
//!
//! Every event gets an [`EventOutcome`]. Only a commit log failure aborts a
//! submission with an error; everything else is reported per event so a
//! producer loop can keep going.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use fintech_rag_core::embedding::EmbeddingStage;
use fintech_rag_core::index::Ack;
use fintech_rag_core::models::{ChangeEvent, DocId, LogicalClock};
use fintech_rag_core::normalize::{Normalizer, RetryDecision, SourceRecord};
use fintech_rag_core::sequencer::Sequencer;
use fintech_rag_core::watermark::SourceOutcome;
use fintech_rag_core::Error;

use crate::config::Config;
use crate::connector_feed::read_feed_file;
use crate::service::LiveIndex;

/// What happened to one change event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied(Ack),
    Duplicate { doc_id: DocId },
    /// The record or event was rejected before sequencing.
    Invalid {
        doc_id: Option<DocId>,
        reason: String,
    },
    EmbeddingFailed {
        doc_id: DocId,
        decision: RetryDecision,
    },
    /// A retried event found the document already rewritten and was discarded.
    Superseded { doc_id: DocId },
}

/// Counts over a batch of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub records: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub retry_scheduled: usize,
    pub dropped: usize,
    pub superseded: usize,
}

impl IngestSummary {
    pub fn add(&mut self, outcome: &EventOutcome) {
        match outcome {
            EventOutcome::Applied(_) => self.applied += 1,
            EventOutcome::Duplicate { .. } => self.duplicates += 1,
            EventOutcome::Invalid { .. } => self.invalid += 1,
            EventOutcome::EmbeddingFailed {
                decision: RetryDecision::Retry { .. },
                ..
            } => self.retry_scheduled += 1,
            EventOutcome::EmbeddingFailed {
                decision: RetryDecision::Drop { .. },
                ..
            } => self.dropped += 1,
            EventOutcome::Superseded { .. } => self.superseded += 1,
        }
    }

    pub fn merge(&mut self, other: &IngestSummary) {
        self.records += other.records;
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.invalid += other.invalid;
        self.retry_scheduled += other.retry_scheduled;
        self.dropped += other.dropped;
        self.superseded += other.superseded;
    }

    pub fn extend<'a>(&mut self, outcomes: impl IntoIterator<Item = &'a EventOutcome>) {
        for o in outcomes {
            self.add(o);
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    normalizer: Arc<Normalizer>,
    embedding: Arc<EmbeddingStage>,
    sequencer: Arc<Sequencer>,
}

impl Pipeline {
    pub fn new(
        normalizer: Arc<Normalizer>,
        embedding: Arc<EmbeddingStage>,
        sequencer: Arc<Sequencer>,
    ) -> Self {
        Self {
            normalizer,
            embedding,
            sequencer,
        }
    }

    pub fn normalizer(&self) -> &Arc<Normalizer> {
        &self.normalizer
    }

    pub fn embedding(&self) -> &Arc<EmbeddingStage> {
        &self.embedding
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    /// Normalize one record and submit every resulting event, in order.
    pub async fn submit_record(
        &self,
        source_id: &str,
        record: SourceRecord,
    ) -> Result<Vec<EventOutcome>> {
        let kind = record.kind();
        let events = match self.normalizer.normalize(source_id, record, Utc::now()) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(source = source_id, kind, error = %e, "record rejected by normalizer");
                self.sequencer
                    .watermarks()
                    .record_outcome(source_id, SourceOutcome::Rejected);
                return Ok(vec![EventOutcome::Invalid {
                    doc_id: None,
                    reason: e.to_string(),
                }]);
            }
        };

        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(self.submit_event(event).await?);
        }
        Ok(outcomes)
    }

    /// Embed (for upserts) and sequence one event.
    pub async fn submit_event(&self, event: ChangeEvent) -> Result<EventOutcome> {
        self.process(event, None).await
    }

    /// Re-submit failed events whose backoff has elapsed at `now`.
    ///
    /// A retry is only applied if its document has not been written since
    /// the original failure; otherwise it comes back as
    /// [`EventOutcome::Superseded`].
    pub async fn retry_due(&self, now: DateTime<Utc>) -> Result<Vec<EventOutcome>> {
        let due = self.normalizer.take_due(now);
        let mut outcomes = Vec::with_capacity(due.len());
        for pending in due {
            tracing::info!(
                doc_id = %pending.event.doc_id(),
                attempt = pending.attempts + 1,
                last_error = %pending.last_error,
                "retrying embedding"
            );
            outcomes.push(self.process(pending.event, Some(pending.head_clock)).await?);
        }
        Ok(outcomes)
    }

    async fn process(&self, event: ChangeEvent, expected_head: Option<LogicalClock>) -> Result<EventOutcome> {
        let vector = if event.is_delete() {
            None
        } else {
            match self.embedding.embed_event(&event).await {
                Ok(v) => Some(v),
                Err(e) => {
                    let head = match expected_head {
                        Some(head) => head,
                        None => self.sequencer.head_clock(&event.doc_id()).await,
                    };
                    return Ok(self.embedding_failed(event, head, &e, Utc::now()));
                }
            }
        };

        let sequenced = match expected_head {
            Some(head) => self.sequencer.submit_if_head(&event, vector, head).await,
            None => self.sequencer.submit(&event, vector).await,
        };
        match sequenced {
            Ok(ack) => {
                self.normalizer.settle(&ack.doc_id);
                tracing::debug!(
                    doc_id = %ack.doc_id,
                    clock = ack.clock.value(),
                    version = ack.version,
                    source = %event.source_id,
                    "event applied"
                );
                Ok(EventOutcome::Applied(ack))
            }
            Err(Error::DuplicateEvent { doc_id, .. }) => {
                self.normalizer.settle(&doc_id);
                Ok(EventOutcome::Duplicate { doc_id })
            }
            Err(Error::Superseded { doc_id, .. }) => {
                self.normalizer.settle(&doc_id);
                Ok(EventOutcome::Superseded { doc_id })
            }
            Err(Error::Log(reason)) => Err(anyhow::anyhow!(
                "commit log refused {}: {}",
                event.doc_id(),
                reason
            )),
            Err(e) => Ok(EventOutcome::Invalid {
                doc_id: Some(event.doc_id()),
                reason: e.to_string(),
            }),
        }
    }

    fn embedding_failed(
        &self,
        event: ChangeEvent,
        head_clock: LogicalClock,
        err: &Error,
        now: DateTime<Utc>,
    ) -> EventOutcome {
        let doc_id = event.doc_id();
        let source_id = event.source_id.clone();
        let watermarks = self.sequencer.watermarks();
        watermarks.record_outcome(&source_id, SourceOutcome::EmbeddingFailed);

        let decision = self
            .normalizer
            .report_embedding_failure(event, head_clock, &err.to_string(), now);
        if matches!(decision, RetryDecision::Drop { .. }) {
            watermarks.record_outcome(&source_id, SourceOutcome::Dropped);
        }
        EventOutcome::EmbeddingFailed { doc_id, decision }
    }
}

/// `frag ingest`: submit every record of a JSON-lines file as `source_id`
/// and make sure the commit log is durable before returning.
pub async fn run_ingest(config: &Config, path: &Path, source_id: &str) -> Result<IngestSummary> {
    if source_id.is_empty() || source_id.contains('/') {
        anyhow::bail!("--source must be non-empty and contain no '/'");
    }
    let batch = read_feed_file(path)?;
    let live = LiveIndex::open(config).await?;

    let mut summary = IngestSummary {
        invalid: batch.malformed,
        ..IngestSummary::default()
    };
    for record in batch.records {
        summary.records += 1;
        let outcomes = live.submit_record(source_id, record).await?;
        summary.extend(&outcomes);
    }
    live.flush()?;

    println!(
        "ingest {}: {} records, {} applied, {} duplicates, {} invalid, {} retry pending, {} dropped (clock {})",
        source_id,
        summary.records,
        summary.applied,
        summary.duplicates,
        summary.invalid,
        summary.retry_scheduled,
        summary.dropped,
        live.index().visible_clock()
    );
    if summary.retry_scheduled > 0 {
        println!("note: events awaiting an embedding retry are not persisted; re-run ingest once the provider recovers");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fintech_rag_core::embedding::{Embedder, EmbeddingStageOptions, HashingEmbedder};
    use fintech_rag_core::index::IncrementalIndex;
    use fintech_rag_core::log::{MemoryLog, NullLog};
    use fintech_rag_core::normalize::NormalizerOptions;
    use fintech_rag_core::watermark::WatermarkTracker;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Hashing embedder that can be switched into failure mode.
    struct Flaky {
        inner: HashingEmbedder,
        failing: AtomicBool,
    }

    #[async_trait]
    impl Embedder for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("provider unavailable");
            }
            self.inner.embed(texts).await
        }
    }

    fn pipeline_with(embedder: Arc<dyn Embedder>, log: Arc<dyn fintech_rag_core::log::CommitLog>) -> Pipeline {
        let dims = embedder.dims();
        Pipeline::new(
            Arc::new(Normalizer::new(NormalizerOptions {
                max_embedding_attempts: 2,
                retry_base_delay: Duration::from_millis(0),
                retry_max_delay: Duration::from_millis(0),
                ..NormalizerOptions::default()
            })),
            Arc::new(EmbeddingStage::new(embedder, EmbeddingStageOptions::default())),
            Arc::new(Sequencer::new(
                IncrementalIndex::new(dims),
                log,
                Arc::new(WatermarkTracker::new()),
            )),
        )
    }

    fn tick(price: f64) -> SourceRecord {
        SourceRecord::MarketTick {
            symbol: "AAPL".into(),
            price,
            volume: None,
            currency: Some("USD".into()),
            exchange: None,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_applied_then_duplicate() {
        let p = pipeline_with(Arc::new(HashingEmbedder::new(16)), Arc::new(NullLog));
        let ts = Utc::now();
        let rec = SourceRecord::NewsArticle {
            id: "n-1".into(),
            headline: "Fed holds rates".into(),
            body: "The committee left rates unchanged.".into(),
            tickers: vec!["SPY".into()],
            publisher: None,
            published_at: ts,
        };

        let first = p.submit_record("news", rec.clone()).await.unwrap();
        assert!(matches!(first[..], [EventOutcome::Applied(_)]));
        let second = p.submit_record("news", rec).await.unwrap();
        assert!(matches!(second[..], [EventOutcome::Duplicate { .. }]));

        let mut summary = IngestSummary::default();
        summary.extend(first.iter().chain(second.iter()));
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.duplicates, 1);
    }

    #[tokio::test]
    async fn test_invalid_record_is_reported() {
        let p = pipeline_with(Arc::new(HashingEmbedder::new(16)), Arc::new(NullLog));
        let out = p.submit_record("market", tick(f64::NAN)).await.unwrap();
        assert!(matches!(out[..], [EventOutcome::Invalid { doc_id: None, .. }]));
        let wm = p.sequencer().watermarks().get("market").unwrap();
        assert_eq!(wm.rejected, 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_retries_then_drops() {
        let flaky = Arc::new(Flaky {
            inner: HashingEmbedder::new(16),
            failing: AtomicBool::new(true),
        });
        let p = pipeline_with(flaky.clone(), Arc::new(NullLog));

        let out = p.submit_record("market", tick(190.0)).await.unwrap();
        assert!(matches!(
            out[..],
            [EventOutcome::EmbeddingFailed { decision: RetryDecision::Retry { attempt: 1, .. }, .. }]
        ));
        assert_eq!(p.normalizer().pending_retries(), 1);
        assert_eq!(p.sequencer().index().visible_clock().value(), 0);

        // second failure hits max_embedding_attempts = 2
        let out = p.retry_due(Utc::now()).await.unwrap();
        assert!(matches!(
            out[..],
            [EventOutcome::EmbeddingFailed { decision: RetryDecision::Drop { attempts: 2 }, .. }]
        ));
        assert_eq!(p.normalizer().pending_retries(), 0);
        let wm = p.sequencer().watermarks().get("market").unwrap();
        assert_eq!(wm.embedding_failures, 2);
        assert_eq!(wm.dropped, 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_recovery() {
        let flaky = Arc::new(Flaky {
            inner: HashingEmbedder::new(16),
            failing: AtomicBool::new(true),
        });
        let p = pipeline_with(flaky.clone(), Arc::new(NullLog));
        p.submit_record("market", tick(190.0)).await.unwrap();

        flaky.failing.store(false, Ordering::SeqCst);
        let out = p.retry_due(Utc::now()).await.unwrap();
        assert!(matches!(out[..], [EventOutcome::Applied(_)]));
        assert_eq!(p.sequencer().index().visible_clock().value(), 1);
    }

    fn sanctions(action: fintech_rag_core::normalize::SanctionsAction, program: &str) -> SourceRecord {
        SourceRecord::SanctionsDelta {
            entity_id: "E-1001".into(),
            name: "Northwind Shipping".into(),
            list: "OFAC".into(),
            program: Some(program.into()),
            aliases: vec![],
            country: None,
            action,
            listed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_removal_discards_pending_update_retry() {
        use fintech_rag_core::normalize::SanctionsAction;

        let flaky = Arc::new(Flaky {
            inner: HashingEmbedder::new(16),
            failing: AtomicBool::new(false),
        });
        let p = pipeline_with(flaky.clone(), Arc::new(NullLog));
        let entity = DocId::new("sanctions", "OFAC:E-1001");

        p.submit_record("sanctions", sanctions(SanctionsAction::Add, "SDN"))
            .await
            .unwrap();

        flaky.failing.store(true, Ordering::SeqCst);
        let out = p
            .submit_record("sanctions", sanctions(SanctionsAction::Update, "SDGT"))
            .await
            .unwrap();
        assert!(matches!(
            out[..],
            [EventOutcome::EmbeddingFailed { decision: RetryDecision::Retry { attempt: 1, .. }, .. }]
        ));
        flaky.failing.store(false, Ordering::SeqCst);

        let out = p
            .submit_record("sanctions", sanctions(SanctionsAction::Remove, "SDN"))
            .await
            .unwrap();
        assert!(matches!(&out[..], [EventOutcome::Applied(ack)] if ack.tombstone && ack.clock == LogicalClock(2)));
        assert_eq!(p.normalizer().pending_retries(), 0);

        assert!(p.retry_due(Utc::now()).await.unwrap().is_empty());
        assert_eq!(p.sequencer().index().visible_clock(), LogicalClock(2));
        assert!(p.sequencer().index().snapshot().get(&entity).is_none());
    }

    #[tokio::test]
    async fn test_overtaken_retry_is_superseded() {
        let p = pipeline_with(Arc::new(HashingEmbedder::new(16)), Arc::new(NullLog));
        let aapl = DocId::new("market", "AAPL");

        p.submit_record("market", tick(150.0)).await.unwrap();
        let stale = p
            .normalizer()
            .normalize("market", tick(151.0), Utc::now())
            .unwrap()
            .remove(0);
        // the 151.0 tick failed while the head was at clock 1, then 152.3 landed
        p.normalizer()
            .report_embedding_failure(stale, LogicalClock(1), "timeout", Utc::now());
        p.sequencer()
            .submit(
                &p.normalizer()
                    .normalize("market", tick(152.3), Utc::now())
                    .unwrap()
                    .remove(0),
                Some(Arc::from(HashingEmbedder::new(16).embed_one("AAPL 152.3"))),
            )
            .await
            .unwrap();

        let out = p.retry_due(Utc::now()).await.unwrap();
        assert_eq!(out, vec![EventOutcome::Superseded { doc_id: aapl.clone() }]);
        assert_eq!(p.sequencer().assigned_clock(), LogicalClock(2));

        let head = p.sequencer().index().snapshot().get(&aapl).unwrap();
        assert_eq!(head.structured_fields.get("price").and_then(|v| v.as_f64()), Some(152.3));

        let mut summary = IngestSummary::default();
        summary.extend(&out);
        assert_eq!(summary.superseded, 1);
    }

    #[tokio::test]
    async fn test_log_failure_is_an_error() {
        let log = Arc::new(MemoryLog::new());
        log.set_failing(true);
        let p = pipeline_with(Arc::new(HashingEmbedder::new(16)), log);
        assert!(p.submit_record("market", tick(190.0)).await.is_err());
        assert_eq!(p.sequencer().assigned_clock().value(), 0);
    }
}
