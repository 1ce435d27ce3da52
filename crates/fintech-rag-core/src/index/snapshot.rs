//! Snapshots and the epoch registry that keeps them safe from compaction.
//!
//! A [`Snapshot`] is nothing more than a [`LogicalClock`] plus a handle on
//! the index. Version records are immutable, so reading "as of" a clock is a
//! per-document lookup of the newest version at or below it.
//!
//! # Epochs
//!
//! ```text
//!   snapshot()                      compact(min_in_use)
//!   ──────────                      ───────────────────
//!   lock(epochs)                    lock(epochs)
//!     c = visible_clock               h = min(min_in_use,
//!     active[c] += 1                          oldest active,
//!   unlock                                    visible_clock)
//!                                   unlock
//!   ...                             reclaim versions ≤ h
//!   drop(snapshot)
//!     active[c] -= 1
//! ```
//!
//! Both sides read the visible clock under the same lock, so a snapshot is
//! either counted before the horizon is chosen or binds to a clock at least
//! as large as it. Reclaiming below a live snapshot cannot happen.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::filter::Filter;
use super::{IndexInner, SearchHit};
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{DocId, IndexedDocument, LogicalClock};

/// How many documents a cancelable search scores between flag checks.
const CANCEL_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Default)]
struct EpochState {
    active: BTreeMap<LogicalClock, usize>,
    horizon: LogicalClock,
}

/// Refcounts of live snapshots keyed by their clock.
#[derive(Debug, Default)]
pub(crate) struct EpochRegistry {
    state: Mutex<EpochState>,
}

impl EpochRegistry {
    /// Register a snapshot at whatever `visible` returns, read under the lock.
    pub(crate) fn register_visible(&self, visible: impl FnOnce() -> LogicalClock) -> LogicalClock {
        let mut state = self.state.lock();
        let clock = visible();
        *state.active.entry(clock).or_default() += 1;
        clock
    }

    /// Register a historical snapshot, refusing clocks that are not visible
    /// yet or were already compacted away.
    pub(crate) fn register_at(
        &self,
        clock: LogicalClock,
        visible: impl FnOnce() -> LogicalClock,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let current = visible();
        if clock > current {
            return Err(Error::InvalidQuery(format!(
                "clock {} is not visible yet (visible clock is {})",
                clock, current
            )));
        }
        if clock < state.horizon {
            return Err(Error::InvalidQuery(format!(
                "clock {} is below the compaction horizon {}",
                clock, state.horizon
            )));
        }
        *state.active.entry(clock).or_default() += 1;
        Ok(())
    }

    fn retain(&self, clock: LogicalClock) {
        *self.state.lock().active.entry(clock).or_default() += 1;
    }

    fn release(&self, clock: LogicalClock) {
        let mut state = self.state.lock();
        if let Some(count) = state.active.get_mut(&clock) {
            *count -= 1;
            if *count == 0 {
                state.active.remove(&clock);
            }
        }
    }

    /// Choose the compaction horizon and remember it.
    pub(crate) fn advance_horizon(
        &self,
        min_in_use: LogicalClock,
        visible: impl FnOnce() -> LogicalClock,
    ) -> LogicalClock {
        let mut state = self.state.lock();
        let visible = visible();
        let oldest = state.active.keys().next().copied().unwrap_or(visible);
        let horizon = min_in_use.min(oldest).min(visible);
        state.horizon = state.horizon.max(horizon);
        horizon
    }

    pub(crate) fn active_count(&self) -> usize {
        self.state.lock().active.values().sum()
    }

    pub(crate) fn oldest(&self) -> Option<LogicalClock> {
        self.state.lock().active.keys().next().copied()
    }

    pub(crate) fn horizon(&self) -> LogicalClock {
        self.state.lock().horizon
    }
}

/// Point-in-time read view of the index.
///
/// Holds its epoch until dropped. Cloning registers another reference at
/// the same clock.
pub struct Snapshot {
    clock: LogicalClock,
    index: Arc<IndexInner>,
}

impl Snapshot {
    pub(crate) fn new(clock: LogicalClock, index: Arc<IndexInner>) -> Self {
        Self { clock, index }
    }

    pub fn clock(&self) -> LogicalClock {
        self.clock
    }

    /// The version of `doc_id` visible at this snapshot, if any.
    pub fn get(&self, doc_id: &DocId) -> Option<Arc<IndexedDocument>> {
        let slot = self.index.slots.get(doc_id).map(|s| s.value().clone())?;
        slot.visible_at(self.clock)
    }

    /// Every visible document, ordered by doc_id.
    pub fn documents(&self) -> Vec<Arc<IndexedDocument>> {
        let mut docs: Vec<Arc<IndexedDocument>> = self
            .index
            .slots
            .iter()
            .filter_map(|entry| entry.value().visible_at(self.clock))
            .collect();
        docs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        docs
    }

    pub fn len(&self) -> usize {
        self.index
            .slots
            .iter()
            .filter(|entry| entry.value().visible_at(self.clock).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-`k` documents by cosine similarity among those visible here and
    /// matching `filter`. Ties are broken by doc_id ascending.
    pub fn search(&self, query: &[f32], k: usize, filter: &Filter) -> Result<Vec<SearchHit>> {
        Ok(self.run_search(query, k, filter, None)?.unwrap_or_default())
    }

    /// Like [`search`](Self::search), but returns `Ok(None)` as soon as
    /// `cancel` is observed set.
    pub fn search_cancelable(
        &self,
        query: &[f32],
        k: usize,
        filter: &Filter,
        cancel: &AtomicBool,
    ) -> Result<Option<Vec<SearchHit>>> {
        self.run_search(query, k, filter, Some(cancel))
    }

    fn run_search(
        &self,
        query: &[f32],
        k: usize,
        filter: &Filter,
        cancel: Option<&AtomicBool>,
    ) -> Result<Option<Vec<SearchHit>>> {
        if k == 0 {
            return Err(Error::InvalidQuery("k must be at least 1".into()));
        }
        if query.len() != self.index.dims {
            return Err(Error::InvalidQuery(format!(
                "query vector has {} dims, index expects {}",
                query.len(),
                self.index.dims
            )));
        }
        if query.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidQuery(
                "query vector holds non-finite values".into(),
            ));
        }
        filter.validate()?;

        let mut heap: BinaryHeap<Reverse<Ranked>> = BinaryHeap::with_capacity(k + 1);
        let mut visited = 0usize;
        let mut cancelled = false;

        let mut consider = |doc: Arc<IndexedDocument>| {
            if !filter.matches(&doc) {
                return;
            }
            let score = cosine_similarity(query, &doc.vector);
            heap.push(Reverse(Ranked { score, doc }));
            if heap.len() > k {
                heap.pop();
            }
        };

        let mut should_stop = || {
            visited += 1;
            if visited % CANCEL_CHECK_INTERVAL == 0
                && cancel.is_some_and(|c| c.load(AtomicOrdering::Relaxed))
            {
                cancelled = true;
            }
            cancelled
        };

        match self.index.postings.candidates(filter) {
            Some(ids) => {
                for id in ids {
                    if should_stop() {
                        break;
                    }
                    let slot = self.index.slots.get(&id).map(|s| s.value().clone());
                    if let Some(doc) = slot.and_then(|s| s.visible_at(self.clock)) {
                        consider(doc);
                    }
                }
            }
            None => {
                for entry in self.index.slots.iter() {
                    if should_stop() {
                        break;
                    }
                    if let Some(doc) = entry.value().visible_at(self.clock) {
                        consider(doc);
                    }
                }
            }
        }

        if cancelled || cancel.is_some_and(|c| c.load(AtomicOrdering::Relaxed)) {
            tracing::debug!(clock = self.clock.value(), visited, "search cancelled");
            return Ok(None);
        }

        Ok(Some(
            heap.into_sorted_vec()
                .into_iter()
                .map(|Reverse(r)| SearchHit {
                    doc_id: r.doc.doc_id.clone(),
                    score: r.score,
                    document: r.doc,
                })
                .collect(),
        ))
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        self.index.epochs.retain(self.clock);
        Self {
            clock: self.clock,
            index: self.index.clone(),
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.index.epochs.release(self.clock);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("clock", &self.clock).finish()
    }
}

/// Heap entry: greater means better (higher score, then smaller doc_id).
struct Ranked {
    score: f32,
    doc: Arc<IndexedDocument>,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.doc.doc_id.cmp(&self.doc.doc_id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_horizon_respects_oldest_snapshot() {
        let epochs = EpochRegistry::default();
        let c = epochs.register_visible(|| LogicalClock(3));
        assert_eq!(c, LogicalClock(3));
        let h = epochs.advance_horizon(LogicalClock(10), || LogicalClock(8));
        assert_eq!(h, LogicalClock(3));

        epochs.release(c);
        let h = epochs.advance_horizon(LogicalClock(10), || LogicalClock(8));
        assert_eq!(h, LogicalClock(8));
        assert_eq!(epochs.active_count(), 0);
    }

    #[test]
    fn test_horizon_bounded_by_min_in_use() {
        let epochs = EpochRegistry::default();
        let h = epochs.advance_horizon(LogicalClock(2), || LogicalClock(8));
        assert_eq!(h, LogicalClock(2));
        assert_eq!(epochs.horizon(), LogicalClock(2));
    }

    #[test]
    fn test_register_at_rejects_future_and_compacted_clocks() {
        let epochs = EpochRegistry::default();
        epochs.advance_horizon(LogicalClock(5), || LogicalClock(9));
        assert!(epochs.register_at(LogicalClock(10), || LogicalClock(9)).is_err());
        assert!(epochs.register_at(LogicalClock(4), || LogicalClock(9)).is_err());
        assert!(epochs.register_at(LogicalClock(5), || LogicalClock(9)).is_ok());
        assert_eq!(epochs.oldest(), Some(LogicalClock(5)));
    }

    #[test]
    fn test_refcount_per_clock() {
        let epochs = EpochRegistry::default();
        epochs.register_visible(|| LogicalClock(1));
        epochs.register_visible(|| LogicalClock(1));
        epochs.release(LogicalClock(1));
        assert_eq!(epochs.oldest(), Some(LogicalClock(1)));
        epochs.release(LogicalClock(1));
        assert_eq!(epochs.oldest(), None);
    }
}
