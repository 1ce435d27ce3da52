//! Multi-version vector + metadata index.
//!
//! Every document owns a *slot* holding an append-only list of immutable
//! [`IndexedDocument`] versions ordered by the clock that produced them.
//! Nothing is ever mutated in place: an update or delete pushes a new
//! version, so a reader pinned to an older clock keeps seeing the older one.
//!
//! ```text
//!   slots: DashMap<DocId, DocSlot>
//!   ┌──────────────┬───────────────────────────────────────────────┐
//!   │ market/AAPL  │ v1 @1 price=150.0 │ v2 @2 price=152.3 │       │
//!   │ sanctions/X  │ v1 @3             │ v2 @5 tombstone   │       │
//!   └──────────────┴───────────────────────────────────────────────┘
//!   visible clock ─ largest C with every clock ≤ C applied
//! ```
//!
//! # Locks
//!
//! | Lock | Guards | Taken by |
//! |------|--------|----------|
//! | slot `writer` (async mutex) | head hash, last version/clock | sequencer handoff, apply, compaction (`try_lock`) |
//! | slot `versions` (rwlock) | version list | readers (short read), apply/compaction (short write) |
//! | commit tracker | completed clocks | apply |
//! | epoch registry | live snapshot clocks, horizon | snapshot, compaction |
//!
//! Applies for different documents never contend on anything but the
//! commit tracker, which is held for a set insert.

pub mod filter;
pub mod snapshot;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::log::CommitRecord;
use crate::models::{validate_fields, DocId, Fields, IndexedDocument, LogicalClock};

pub use filter::{FieldClause, FieldPostings, Filter};
pub use snapshot::Snapshot;

use snapshot::EpochRegistry;

/// Acknowledgement of an installed version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub doc_id: DocId,
    pub clock: LogicalClock,
    pub version: u64,
    pub tombstone: bool,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub doc_id: DocId,
    pub score: f32,
    pub document: Arc<IndexedDocument>,
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    pub horizon: LogicalClock,
    pub versions_removed: usize,
    /// Documents whose last version was a tombstone at or below the horizon
    /// and which now hold no versions at all.
    pub docs_reclaimed: usize,
    /// Slots skipped because a writer held them; retried next pass.
    pub slots_busy: usize,
    pub duration_ms: u64,
    pub ran_at: DateTime<Utc>,
}

/// Point-in-time size and health figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub dims: usize,
    /// Non-tombstoned documents at the visible clock.
    pub documents: usize,
    pub tombstoned: usize,
    pub versions: usize,
    pub slots: usize,
    pub posting_lists: usize,
    pub visible_clock: LogicalClock,
    pub active_snapshots: usize,
    pub oldest_snapshot: Option<LogicalClock>,
    pub compaction_horizon: LogicalClock,
    pub compactions: u64,
    pub versions_reclaimed: u64,
    pub last_compaction: Option<CompactionStats>,
}

/// Writer-side state of one document, guarded by the slot's apply lock.
#[derive(Debug, Default)]
pub(crate) struct WriterState {
    last_version: u64,
    last_clock: LogicalClock,
    head_hash: Option<String>,
    head_tombstoned: bool,
}

#[derive(Debug, Default)]
pub(crate) struct DocSlot {
    writer: Arc<tokio::sync::Mutex<WriterState>>,
    versions: RwLock<Vec<Arc<IndexedDocument>>>,
}

impl DocSlot {
    /// Newest version at or below `clock`, unless it is a tombstone.
    pub(crate) fn visible_at(&self, clock: LogicalClock) -> Option<Arc<IndexedDocument>> {
        let versions = self.versions.read();
        versions
            .iter()
            .rev()
            .find(|v| v.version_applied <= clock)
            .filter(|v| !v.tombstoned)
            .cloned()
    }
}

/// Contiguous-prefix tracker over completed clocks.
#[derive(Debug, Default)]
struct CommitTracker {
    visible: LogicalClock,
    done: BTreeSet<LogicalClock>,
}

impl CommitTracker {
    fn complete(&mut self, clock: LogicalClock) -> Option<LogicalClock> {
        if clock <= self.visible {
            return None;
        }
        self.done.insert(clock);
        let before = self.visible;
        while self.done.remove(&self.visible.next()) {
            self.visible = self.visible.next();
        }
        (self.visible != before).then_some(self.visible)
    }
}

#[derive(Debug, Default)]
struct CompactionTotals {
    runs: u64,
    versions_removed: u64,
    last: Option<CompactionStats>,
}

pub(crate) struct IndexInner {
    pub(crate) dims: usize,
    pub(crate) slots: DashMap<DocId, Arc<DocSlot>>,
    pub(crate) postings: FieldPostings,
    pub(crate) epochs: EpochRegistry,
    commits: Mutex<CommitTracker>,
    visible: AtomicU64,
    visible_tx: watch::Sender<LogicalClock>,
    compaction: Mutex<CompactionTotals>,
}

impl IndexInner {
    fn visible_clock(&self) -> LogicalClock {
        LogicalClock(self.visible.load(Ordering::Acquire))
    }

    fn complete(&self, clock: LogicalClock) {
        let mut commits = self.commits.lock();
        if let Some(visible) = commits.complete(clock) {
            self.visible.store(visible.value(), Ordering::Release);
            self.visible_tx.send_replace(visible);
        }
    }
}

/// Exclusive right to install the next version of one document.
///
/// Obtained by the sequencer inside its critical section; holding it while
/// the sequencing lock is released keeps per-document application in clock
/// order.
pub struct ApplyPermit {
    doc_id: DocId,
    slot: Arc<DocSlot>,
    state: OwnedMutexGuard<WriterState>,
}

impl ApplyPermit {
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// Content hash of the newest applied version.
    pub fn head_content_hash(&self) -> Option<&str> {
        self.state.head_hash.as_deref()
    }

    /// True when the document has no version, or its newest is a tombstone.
    pub fn is_absent(&self) -> bool {
        self.state.head_hash.is_none() || self.state.head_tombstoned
    }

    pub fn last_clock(&self) -> LogicalClock {
        self.state.last_clock
    }
}

/// Shared handle to the multi-version index. Cheap to clone.
#[derive(Clone)]
pub struct IncrementalIndex {
    inner: Arc<IndexInner>,
}

impl IncrementalIndex {
    /// Create an empty index for vectors of `dims` dimensions.
    pub fn new(dims: usize) -> Self {
        let (visible_tx, _) = watch::channel(LogicalClock::ZERO);
        Self {
            inner: Arc::new(IndexInner {
                dims,
                slots: DashMap::new(),
                postings: FieldPostings::new(),
                epochs: EpochRegistry::default(),
                commits: Mutex::new(CommitTracker::default()),
                visible: AtomicU64::new(0),
                visible_tx,
                compaction: Mutex::new(CompactionTotals::default()),
            }),
        }
    }

    pub fn dims(&self) -> usize {
        self.inner.dims
    }

    /// Largest clock C such that every clock ≤ C has been applied.
    pub fn visible_clock(&self) -> LogicalClock {
        self.inner.visible_clock()
    }

    /// Receiver that changes whenever the visible clock advances.
    pub fn subscribe_visible(&self) -> watch::Receiver<LogicalClock> {
        self.inner.visible_tx.subscribe()
    }

    /// Validate a prospective version without touching any state.
    pub fn check(&self, doc_id: &DocId, vector: &[f32], fields: &Fields, tombstone: bool) -> Result<()> {
        if doc_id.as_str().trim().is_empty() {
            return Err(Error::InvalidDocument("empty doc_id".into()));
        }
        if !tombstone {
            if vector.len() != self.inner.dims {
                return Err(Error::InvalidDocument(format!(
                    "{}: vector has {} dims, index expects {}",
                    doc_id,
                    vector.len(),
                    self.inner.dims
                )));
            }
            if vector.iter().any(|x| !x.is_finite()) {
                return Err(Error::InvalidDocument(format!(
                    "{}: vector holds non-finite values",
                    doc_id
                )));
            }
        }
        validate_fields(fields)
    }

    /// Take the apply lock of `doc_id`, creating its slot if needed.
    /// Waits for any in-flight apply of the same document.
    pub async fn lock_doc(&self, doc_id: &DocId) -> ApplyPermit {
        let slot = self
            .inner
            .slots
            .entry(doc_id.clone())
            .or_default()
            .value()
            .clone();
        let state = slot.writer.clone().lock_owned().await;
        ApplyPermit {
            doc_id: doc_id.clone(),
            slot,
            state,
        }
    }

    /// Like [`lock_doc`](Self::lock_doc) but never creates a slot.
    pub async fn lock_existing_doc(&self, doc_id: &DocId) -> Option<ApplyPermit> {
        let slot = self.inner.slots.get(doc_id).map(|s| s.value().clone())?;
        let state = slot.writer.clone().lock_owned().await;
        Some(ApplyPermit {
            doc_id: doc_id.clone(),
            slot,
            state,
        })
    }

    /// Install the version described by `record`.
    ///
    /// The new version is invisible to snapshots until every lower clock has
    /// been applied too. A refused record still completes its clock as a
    /// no-op, so visibility never stalls behind it.
    pub async fn apply(&self, record: &CommitRecord) -> Result<Ack> {
        let permit = self.lock_doc(&record.doc_id).await;
        self.apply_locked(permit, record)
    }

    /// Install `record` using a permit taken earlier with
    /// [`lock_doc`](Self::lock_doc). Consumes the permit.
    pub fn apply_locked(&self, mut permit: ApplyPermit, record: &CommitRecord) -> Result<Ack> {
        let result = self.install(&mut permit, record);
        drop(permit);
        if let Err(e) = &result {
            tracing::warn!(doc_id = %record.doc_id, clock = record.clock.value(), error = %e, "apply refused");
        }
        self.inner.complete(record.clock);
        result
    }

    fn install(&self, permit: &mut ApplyPermit, record: &CommitRecord) -> Result<Ack> {
        if record.doc_id != permit.doc_id {
            return Err(Error::InvalidDocument(format!(
                "permit for {} used to apply {}",
                permit.doc_id, record.doc_id
            )));
        }
        self.check(&record.doc_id, &record.vector, &record.fields, record.tombstone)?;
        if record.clock == LogicalClock::ZERO || record.clock <= permit.state.last_clock {
            return Err(Error::InvalidDocument(format!(
                "{}: clock {} does not follow last applied clock {}",
                record.doc_id, record.clock, permit.state.last_clock
            )));
        }

        let version = permit.state.last_version + 1;
        let doc = Arc::new(IndexedDocument {
            doc_id: record.doc_id.clone(),
            version,
            vector: record.vector.clone(),
            structured_fields: record.fields.clone(),
            tombstoned: record.tombstone,
            version_applied: record.clock,
            source_id: record.source_id.clone(),
            external_id: record.external_id.clone(),
            content_hash: record.content_hash.clone(),
            payload_text: record.payload_text.clone(),
            observed_at: record.observed_at,
        });

        // postings first: they only ever over-approximate
        if !record.tombstone {
            self.inner.postings.insert(&record.doc_id, &record.fields);
        }
        permit.slot.versions.write().push(doc);

        let state = &mut *permit.state;
        state.last_version = version;
        state.last_clock = record.clock;
        state.head_hash = Some(record.content_hash.clone());
        state.head_tombstoned = record.tombstone;

        tracing::debug!(
            doc_id = %record.doc_id,
            clock = record.clock.value(),
            version,
            tombstone = record.tombstone,
            "version installed"
        );

        Ok(Ack {
            doc_id: record.doc_id.clone(),
            clock: record.clock,
            version,
            tombstone: record.tombstone,
        })
    }

    /// Snapshot bound to the current visible clock. O(1) with respect to
    /// writers.
    pub fn snapshot(&self) -> Snapshot {
        let clock = self
            .inner
            .epochs
            .register_visible(|| self.inner.visible_clock());
        Snapshot::new(clock, self.inner.clone())
    }

    /// Snapshot at an older clock, provided it is visible and has not been
    /// compacted away.
    pub fn snapshot_at(&self, clock: LogicalClock) -> Result<Snapshot> {
        self.inner
            .epochs
            .register_at(clock, || self.inner.visible_clock())?;
        Ok(Snapshot::new(clock, self.inner.clone()))
    }

    /// Convenience wrapper over [`Snapshot::search`].
    pub fn search(
        &self,
        snapshot: &Snapshot,
        query: &[f32],
        k: usize,
        filter: &Filter,
    ) -> Result<Vec<SearchHit>> {
        snapshot.search(query, k, filter)
    }

    /// Reclaim superseded and tombstoned versions at or below
    /// `min(min_in_use, oldest live snapshot, visible clock)`.
    ///
    /// For each document, of the versions at or below the horizon only the
    /// newest is kept, and not even that one if it is a tombstone. Documents
    /// whose writer is busy are skipped.
    pub fn compact(&self, min_in_use: LogicalClock) -> CompactionStats {
        let started = Instant::now();
        let horizon = self
            .inner
            .epochs
            .advance_horizon(min_in_use, || self.inner.visible_clock());

        let slots: Vec<(DocId, Arc<DocSlot>)> = self
            .inner
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut versions_removed = 0usize;
        let mut docs_reclaimed = 0usize;
        let mut slots_busy = 0usize;

        for (doc_id, slot) in slots {
            let Ok(_writer) = slot.writer.try_lock() else {
                slots_busy += 1;
                continue;
            };
            let mut versions = slot.versions.write();
            let Some(pivot) = versions.iter().rposition(|v| v.version_applied <= horizon) else {
                continue;
            };
            let cut = if versions[pivot].tombstoned {
                pivot + 1
            } else {
                pivot
            };
            if cut == 0 {
                continue;
            }

            let removed: Vec<Arc<IndexedDocument>> = versions.drain(..cut).collect();
            let removed_fields: Vec<&Fields> =
                removed.iter().map(|v| &v.structured_fields).collect();
            let retained_fields: Vec<&Fields> =
                versions.iter().map(|v| &v.structured_fields).collect();
            self.inner
                .postings
                .remove_stale(&doc_id, &removed_fields, &retained_fields);

            versions_removed += removed.len();
            if versions.is_empty() {
                versions.shrink_to_fit();
                docs_reclaimed += 1;
            }
        }

        let stats = CompactionStats {
            horizon,
            versions_removed,
            docs_reclaimed,
            slots_busy,
            duration_ms: started.elapsed().as_millis() as u64,
            ran_at: Utc::now(),
        };

        let mut totals = self.inner.compaction.lock();
        totals.runs += 1;
        totals.versions_removed += versions_removed as u64;
        totals.last = Some(stats.clone());

        tracing::info!(
            horizon = horizon.value(),
            versions_removed,
            docs_reclaimed,
            slots_busy,
            "compaction finished"
        );
        stats
    }

    pub fn stats(&self) -> IndexStats {
        let visible = self.inner.visible_clock();
        let mut documents = 0;
        let mut tombstoned = 0;
        let mut versions = 0;
        let mut slots = 0;
        for entry in self.inner.slots.iter() {
            slots += 1;
            let list = entry.value().versions.read();
            versions += list.len();
            match list.iter().rev().find(|v| v.version_applied <= visible) {
                Some(v) if v.tombstoned => tombstoned += 1,
                Some(_) => documents += 1,
                None => {}
            }
        }
        let totals = self.inner.compaction.lock();
        IndexStats {
            dims: self.inner.dims,
            documents,
            tombstoned,
            versions,
            slots,
            posting_lists: self.inner.postings.list_count(),
            visible_clock: visible,
            active_snapshots: self.inner.epochs.active_count(),
            oldest_snapshot: self.inner.epochs.oldest(),
            compaction_horizon: self.inner.epochs.horizon(),
            compactions: totals.runs,
            versions_reclaimed: totals.versions_removed,
            last_compaction: totals.last.clone(),
        }
    }
}
