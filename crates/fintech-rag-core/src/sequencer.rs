//! Ingestion sequencer: the only place logical clocks are assigned.
//!
//! # Critical section
//!
//! ```text
//!   lock(seq)                      ── FIFO across all producers
//!     permit = index.lock_doc(id)  ── waits for an in-flight apply of id
//!     duplicate check vs. head
//!     clock = clock + 1
//!     log.append(record)           ── failure: clock not consumed
//!   unlock(seq)
//!   index.apply_locked(permit)     ── parallel across documents
//!   watermarks.record_applied
//! ```
//!
//! Holding the document permit across the unlock is what keeps per-document
//! application in clock order while applies of unrelated documents proceed
//! concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::index::{Ack, IncrementalIndex};
use crate::log::{CommitLog, CommitRecord};
use crate::models::{ChangeEvent, DocId, LogicalClock};
use crate::watermark::{SourceOutcome, WatermarkTracker};

/// Summary of a log replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub records: usize,
    /// Records the index refused; their clocks were still consumed.
    pub refused: usize,
    pub last_clock: LogicalClock,
}

/// Orders change events and hands them to the index.
pub struct Sequencer {
    index: IncrementalIndex,
    log: Arc<dyn CommitLog>,
    watermarks: Arc<WatermarkTracker>,
    clock: Mutex<LogicalClock>,
    assigned: AtomicU64,
}

impl Sequencer {
    pub fn new(
        index: IncrementalIndex,
        log: Arc<dyn CommitLog>,
        watermarks: Arc<WatermarkTracker>,
    ) -> Self {
        Self {
            index,
            log,
            watermarks,
            clock: Mutex::new(LogicalClock::ZERO),
            assigned: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> &IncrementalIndex {
        &self.index
    }

    pub fn watermarks(&self) -> &Arc<WatermarkTracker> {
        &self.watermarks
    }

    /// Highest clock handed out so far (may not be visible yet).
    pub fn assigned_clock(&self) -> LogicalClock {
        LogicalClock(self.assigned.load(Ordering::Acquire))
    }

    /// Sequence and apply one event.
    ///
    /// `vector` is required for upserts and ignored for deletes. Returns
    /// [`Error::DuplicateEvent`] without touching any state when the event's
    /// content hash equals the document's current head, or when a delete
    /// targets a document that is absent.
    pub async fn submit(&self, event: &ChangeEvent, vector: Option<Arc<[f32]>>) -> Result<Ack> {
        self.sequence(event, vector, None).await
    }

    /// Like [`submit`](Self::submit), but only if the document's last
    /// applied clock still equals `expected_head`. Otherwise returns
    /// [`Error::Superseded`] without touching any state.
    ///
    /// Used for retried events: the check runs inside the critical section,
    /// so a write that lands while the retry is being embedded still wins.
    pub async fn submit_if_head(
        &self,
        event: &ChangeEvent,
        vector: Option<Arc<[f32]>>,
        expected_head: LogicalClock,
    ) -> Result<Ack> {
        self.sequence(event, vector, Some(expected_head)).await
    }

    /// Last clock applied to `doc_id`, or zero if it was never written.
    /// Waits for an in-flight apply of the document.
    pub async fn head_clock(&self, doc_id: &DocId) -> LogicalClock {
        match self.index.lock_existing_doc(doc_id).await {
            Some(permit) => permit.last_clock(),
            None => LogicalClock::ZERO,
        }
    }

    async fn sequence(
        &self,
        event: &ChangeEvent,
        vector: Option<Arc<[f32]>>,
        expected_head: Option<LogicalClock>,
    ) -> Result<Ack> {
        let doc_id = event.doc_id();
        let tombstone = event.is_delete();
        let vector: Arc<[f32]> = match (tombstone, vector) {
            (true, _) => Arc::from(Vec::new()),
            (false, Some(v)) => v,
            (false, None) => {
                return Err(self.reject(
                    event,
                    Error::InvalidDocument(format!("{}: upsert without a vector", doc_id)),
                ))
            }
        };
        if let Err(e) = event
            .validate()
            .and_then(|_| self.index.check(&doc_id, &vector, &event.structured_fields, tombstone))
        {
            return Err(self.reject(event, e));
        }

        let (permit, record) = {
            let mut clock = self.clock.lock().await;

            if let Some(expected) = expected_head {
                let head = match self.index.lock_existing_doc(&doc_id).await {
                    Some(p) => p.last_clock(),
                    None => LogicalClock::ZERO,
                };
                if head != expected {
                    return Err(self.superseded(event, expected, head));
                }
            }

            let permit = if tombstone {
                match self.index.lock_existing_doc(&doc_id).await {
                    Some(p) if !p.is_absent() => p,
                    _ => return Err(self.duplicate(event)),
                }
            } else {
                let p = self.index.lock_doc(&doc_id).await;
                if p.head_content_hash() == Some(event.content_hash.as_str()) {
                    return Err(self.duplicate(event));
                }
                p
            };

            let next = clock.next();
            let record = CommitRecord {
                clock: next,
                doc_id: doc_id.clone(),
                source_id: event.source_id.clone(),
                external_id: event.external_id.clone(),
                content_hash: event.content_hash.clone(),
                vector,
                fields: event.structured_fields.clone(),
                tombstone,
                payload_text: Arc::from(event.payload_text.as_str()),
                observed_at: event.observed_at,
                received_at: event.received_at,
                committed_at: Utc::now(),
            };
            self.log
                .append(&record)
                .map_err(|e| Error::Log(format!("{:#}", e)))?;
            *clock = next;
            self.assigned.store(next.value(), Ordering::Release);
            (permit, record)
        };

        let ack = self.index.apply_locked(permit, &record)?;
        self.watermarks.record_applied(
            &record.source_id,
            record.clock,
            record.observed_at,
            record.received_at,
            Utc::now(),
        );
        Ok(ack)
    }

    /// Rebuild index and watermarks from a commit log, in clock order.
    ///
    /// Clocks must continue exactly where the sequencer stands; any gap or
    /// regression aborts with [`Error::Log`]. Nothing is written back to the
    /// log.
    pub async fn replay<I>(&self, records: I) -> Result<ReplayStats>
    where
        I: IntoIterator<Item = CommitRecord>,
    {
        let mut clock = self.clock.lock().await;
        let mut stats = ReplayStats {
            last_clock: *clock,
            ..ReplayStats::default()
        };

        for record in records {
            if record.clock != clock.next() {
                return Err(Error::Log(format!(
                    "replay expected clock {}, found {} for {}",
                    clock.next(),
                    record.clock,
                    record.doc_id
                )));
            }
            *clock = record.clock;
            self.assigned.store(record.clock.value(), Ordering::Release);
            stats.records += 1;
            stats.last_clock = record.clock;

            match self.index.apply(&record).await {
                Ok(_) => self.watermarks.record_applied(
                    &record.source_id,
                    record.clock,
                    record.observed_at,
                    record.received_at,
                    record.committed_at,
                ),
                Err(_) => stats.refused += 1,
            }
        }

        tracing::info!(
            records = stats.records,
            refused = stats.refused,
            clock = stats.last_clock.value(),
            "commit log replayed"
        );
        Ok(stats)
    }

    fn superseded(&self, event: &ChangeEvent, expected: LogicalClock, head: LogicalClock) -> Error {
        tracing::info!(
            doc_id = %event.doc_id(),
            source = %event.source_id,
            expected = expected.value(),
            head = head.value(),
            "retried event superseded by a newer write"
        );
        self.watermarks
            .record_outcome(&event.source_id, SourceOutcome::Dropped);
        Error::Superseded {
            doc_id: event.doc_id(),
            expected,
            head,
        }
    }

    fn duplicate(&self, event: &ChangeEvent) -> Error {
        tracing::debug!(
            doc_id = %event.doc_id(),
            source = %event.source_id,
            "duplicate event dropped"
        );
        self.watermarks
            .record_outcome(&event.source_id, SourceOutcome::Duplicate);
        Error::DuplicateEvent {
            doc_id: event.doc_id(),
            content_hash: event.content_hash.clone(),
        }
    }

    fn reject(&self, event: &ChangeEvent, err: Error) -> Error {
        tracing::warn!(source = %event.source_id, error = %err, "event rejected");
        self.watermarks
            .record_outcome(&event.source_id, SourceOutcome::Rejected);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Filter;
    use crate::log::MemoryLog;
    use crate::models::{DocId, Fields, Scalar};
    use chrono::Utc;
    use proptest::prelude::*;

    fn tick(symbol: &str, price: f64) -> ChangeEvent {
        let now = Utc::now();
        let mut fields = Fields::new();
        fields.insert("symbol".into(), Scalar::Str(symbol.into()));
        fields.insert("price".into(), Scalar::Float(price));
        ChangeEvent::upsert(
            "market",
            symbol,
            format!("{symbol} trades at {price}"),
            fields,
            now,
            now,
        )
    }

    fn vec2(x: f32, y: f32) -> Option<Arc<[f32]>> {
        Some(Arc::from(vec![x, y]))
    }

    fn setup() -> (Sequencer, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let seq = Sequencer::new(
            IncrementalIndex::new(2),
            log.clone(),
            Arc::new(WatermarkTracker::new()),
        );
        (seq, log)
    }

    #[tokio::test]
    async fn test_aapl_price_update_keeps_old_snapshot() {
        let (seq, _) = setup();
        let a1 = seq.submit(&tick("AAPL", 150.0), vec2(1.0, 0.0)).await.unwrap();
        assert_eq!(a1.clock, LogicalClock(1));
        let s1 = seq.index().snapshot();
        let a2 = seq.submit(&tick("AAPL", 152.3), vec2(1.0, 0.0)).await.unwrap();
        assert_eq!(a2.clock, LogicalClock(2));

        let id = DocId::new("market", "AAPL");
        let old = s1.get(&id).unwrap();
        assert_eq!(old.structured_fields["price"], Scalar::Float(150.0));
        let new = seq.index().snapshot().get(&id).unwrap();
        assert_eq!(new.structured_fields["price"], Scalar::Float(152.3));
    }

    #[tokio::test]
    async fn test_resubmit_is_noop() {
        let (seq, log) = setup();
        let ev = tick("AAPL", 150.0);
        seq.submit(&ev, vec2(1.0, 0.0)).await.unwrap();
        let err = seq.submit(&ev, vec2(1.0, 0.0)).await.unwrap_err();
        assert!(err.is_benign());
        assert_eq!(seq.assigned_clock(), LogicalClock(1));
        assert_eq!(seq.index().visible_clock(), LogicalClock(1));
        assert_eq!(log.len(), 1);
        assert_eq!(seq.watermarks().get("market").unwrap().duplicates, 1);
    }

    #[tokio::test]
    async fn test_delete_of_absent_doc_is_duplicate() {
        let (seq, log) = setup();
        let now = Utc::now();
        let del = ChangeEvent::delete("sanctions", "OFAC:123", now, now);
        assert!(matches!(
            seq.submit(&del, None).await,
            Err(Error::DuplicateEvent { .. })
        ));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_tombstone_then_repeat_delete() {
        let (seq, _) = setup();
        seq.submit(&tick("X", 1.0), vec2(1.0, 0.0)).await.unwrap();
        let now = Utc::now();
        let del = ChangeEvent::delete("market", "X", now, now);
        let ack = seq.submit(&del, None).await.unwrap();
        assert!(ack.tombstone);
        assert!(seq.submit(&del, None).await.unwrap_err().is_benign());
        assert!(seq.index().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_document_consumes_no_clock() {
        let (seq, log) = setup();
        let err = seq
            .submit(&tick("AAPL", 150.0), Some(Arc::from(vec![1.0f32, 0.0, 0.0])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
        assert!(seq.submit(&tick("AAPL", 150.0), None).await.is_err());
        assert_eq!(seq.assigned_clock(), LogicalClock::ZERO);
        assert!(log.is_empty());
        assert_eq!(seq.watermarks().get("market").unwrap().rejected, 2);
    }

    #[tokio::test]
    async fn test_log_failure_aborts_before_clock() {
        let (seq, log) = setup();
        log.set_failing(true);
        let err = seq.submit(&tick("AAPL", 150.0), vec2(1.0, 0.0)).await.unwrap_err();
        assert!(matches!(err, Error::Log(_)));
        assert_eq!(seq.assigned_clock(), LogicalClock::ZERO);
        assert!(seq.index().snapshot().is_empty());

        log.set_failing(false);
        let ack = seq.submit(&tick("AAPL", 150.0), vec2(1.0, 0.0)).await.unwrap();
        assert_eq!(ack.clock, LogicalClock(1));
    }

    #[tokio::test]
    async fn test_replay_restores_state_and_clock() {
        let (seq, log) = setup();
        seq.submit(&tick("AAPL", 150.0), vec2(1.0, 0.0)).await.unwrap();
        seq.submit(&tick("MSFT", 400.0), vec2(0.0, 1.0)).await.unwrap();
        seq.submit(&tick("AAPL", 152.3), vec2(1.0, 0.0)).await.unwrap();

        let (fresh, _) = setup();
        let stats = fresh.replay(log.records()).await.unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.last_clock, LogicalClock(3));
        assert_eq!(fresh.index().visible_clock(), LogicalClock(3));
        assert_eq!(
            fresh.watermarks().get("market").unwrap().last_clock,
            LogicalClock(3)
        );
        let doc = fresh
            .index()
            .snapshot()
            .get(&DocId::new("market", "AAPL"))
            .unwrap();
        assert_eq!(doc.version, 2);

        let ack = fresh.submit(&tick("TSLA", 200.0), vec2(1.0, 1.0)).await.unwrap();
        assert_eq!(ack.clock, LogicalClock(4));
    }

    #[tokio::test]
    async fn test_replay_rejects_gap() {
        let (seq, log) = setup();
        seq.submit(&tick("AAPL", 150.0), vec2(1.0, 0.0)).await.unwrap();
        seq.submit(&tick("MSFT", 400.0), vec2(0.0, 1.0)).await.unwrap();
        let mut records = log.records();
        records.remove(0);

        let (fresh, _) = setup();
        assert!(matches!(fresh.replay(records).await, Err(Error::Log(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_get_distinct_contiguous_clocks() {
        let (seq, log) = setup();
        let seq = Arc::new(seq);
        let mut handles = Vec::new();
        for p in 0..4 {
            let seq = seq.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let ev = tick(&format!("S{p}-{i}"), i as f64);
                    seq.submit(&ev, vec2(1.0, p as f32)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(seq.index().visible_clock(), LogicalClock(100));
        let clocks: Vec<u64> = log.records().iter().map(|r| r.clock.value()).collect();
        assert_eq!(clocks, (1..=100).collect::<Vec<_>>());
        assert_eq!(seq.index().snapshot().len(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_of_one_doc_apply_in_clock_order() {
        let (seq, _) = setup();
        let seq = Arc::new(seq);
        let mut handles = Vec::new();
        for p in 0..4 {
            let seq = seq.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let price = (p * 100 + i) as f64;
                    seq.submit(&tick("AAPL", price), vec2(1.0, 0.0)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let doc = seq
            .index()
            .snapshot()
            .get(&DocId::new("market", "AAPL"))
            .unwrap();
        assert_eq!(doc.version, 40);
        assert_eq!(doc.version_applied, LogicalClock(40));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, u8),
        Del(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, 0u8..4).prop_map(|(d, v)| Op::Put(d, v)),
            (0u8..6).prop_map(Op::Del),
        ]
    }

    #[tokio::test]
    async fn test_submit_if_head_refuses_overtaken_event() {
        let (seq, log) = setup();
        let aapl = DocId::new("market", "AAPL");
        seq.submit(&tick("AAPL", 150.0), vec2(1.0, 0.0)).await.unwrap();
        let seen = seq.head_clock(&aapl).await;
        assert_eq!(seen, LogicalClock(1));

        seq.submit(&tick("AAPL", 152.3), vec2(0.0, 1.0)).await.unwrap();
        let err = seq
            .submit_if_head(&tick("AAPL", 151.0), vec2(1.0, 1.0), seen)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Superseded { head: LogicalClock(2), .. }
        ));
        assert_eq!(seq.assigned_clock(), LogicalClock(2));
        assert_eq!(log.len(), 2);

        let ack = seq
            .submit_if_head(&tick("AAPL", 153.0), vec2(1.0, 1.0), LogicalClock(2))
            .await
            .unwrap();
        assert_eq!(ack.clock, LogicalClock(3));
        assert_eq!(seq.head_clock(&DocId::new("market", "MSFT")).await, LogicalClock::ZERO);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// A snapshot at clock C holds exactly the documents whose newest
        /// event at or below C is an upsert, however later writes go.
        #[test]
        fn prop_snapshot_visibility_matches_model(ops in prop::collection::vec(op(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (seq, _) = setup();
                let mut model: std::collections::BTreeMap<String, u8> = Default::default();
                let mut checkpoints = Vec::new();

                for (i, op) in ops.iter().enumerate() {
                    let now = Utc::now();
                    let ev = match op {
                        Op::Put(d, v) => ChangeEvent::upsert(
                            "s", format!("d{d}"), format!("value {v}"), Fields::new(), now, now),
                        Op::Del(d) => ChangeEvent::delete("s", format!("d{d}"), now, now),
                    };
                    let y = match op {
                        Op::Put(_, v) => *v as f32,
                        Op::Del(_) => 0.0,
                    };
                    let _ = seq.submit(&ev, vec2(1.0, y)).await;
                    match op {
                        Op::Put(d, v) => { model.insert(format!("s/d{d}"), *v); }
                        Op::Del(d) => { model.remove(&format!("s/d{d}")); }
                    }
                    if i % 3 == 0 {
                        checkpoints.push((seq.index().snapshot(), model.clone()));
                    }
                }
                seq.index().compact(seq.index().visible_clock());

                for (snap, expected) in checkpoints {
                    let seen: std::collections::BTreeMap<String, u8> = snap
                        .documents()
                        .iter()
                        .map(|d| {
                            let v = d.payload_text.trim_start_matches("value ").parse().unwrap();
                            (d.doc_id.to_string(), v)
                        })
                        .collect();
                    assert_eq!(seen, expected);
                    let hits = snap.search(&[1.0, 0.0], 64, &Filter::new()).unwrap();
                    assert_eq!(hits.len(), expected.len());
                }
            });
        }
    }
}
