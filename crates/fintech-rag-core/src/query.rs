//! Query engine with bounded-staleness reads.
//!
//! The engine operates purely on the index, the watermark tracker and the
//! embedding stage; it performs no I/O of its own.
//!
//! # Lifecycle
//!
//! ```text
//! Received ──► [WaitingForWatermark] ──► BoundToSnapshot ──► Searching ──► Ranked ──► Returned
//! ```
//!
//! 1. The request is validated (`k`, text or vector, filter).
//! 2. The *required sources* are the filter's sources, or every known source.
//! 3. A source is fresh when its lag is within the consistency bound and its
//!    last applied clock is visible. If any required source is stale and the
//!    caller asked for a wait, the engine waits (up to the requested maximum,
//!    capped by configuration) for watermark or visibility changes.
//! 4. The query binds to a snapshot; freshness is re-evaluated against that
//!    snapshot and reported as `stale_beyond_bound` / `stale_sources`.
//!
//! Staleness never fails a query. Without an explicit wait, a stale answer
//! is returned immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingStage;
use crate::error::{Error, Result};
use crate::index::{Filter, IncrementalIndex, Snapshot};
use crate::models::{DocId, Fields, LogicalClock};
use crate::watermark::WatermarkTracker;

/// Query input: free text (embedded by the engine) or a ready vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryInput {
    Text(String),
    Vector(Vec<f32>),
}

/// A query as submitted by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub input: QueryInput,
    #[serde(default)]
    pub filter: Filter,
    /// Defaults to the engine's `default_k`.
    #[serde(default)]
    pub k: Option<usize>,
    /// Maximum acceptable lag per required source, in milliseconds.
    #[serde(default)]
    pub consistency_bound_ms: Option<u64>,
    /// Opt-in wait for fresh data, in milliseconds. Zero or absent: no wait.
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
}

impl QueryRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(QueryInput::Text(text.into()))
    }

    pub fn vector(vector: Vec<f32>) -> Self {
        Self::new(QueryInput::Vector(vector))
    }

    fn new(input: QueryInput) -> Self {
        Self {
            input,
            filter: Filter::default(),
            k: None,
            consistency_bound_ms: None,
            max_wait_ms: None,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_bound(mut self, bound: Duration) -> Self {
        self.consistency_bound_ms = Some(bound.as_millis() as u64);
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait_ms = Some(wait.as_millis() as u64);
        self
    }
}

/// One ranked, self-describing result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub doc_id: DocId,
    pub score: f32,
    pub source_id: String,
    pub external_id: String,
    pub version: u64,
    pub version_applied: LogicalClock,
    pub fields: Fields,
    pub text: String,
    pub observed_at: DateTime<Utc>,
}

/// Answer to a [`QueryRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub results: Vec<QueryResult>,
    pub snapshot_clock: LogicalClock,
    /// Lag of every required source that has ever been applied, in ms.
    pub per_source_lag: BTreeMap<String, u64>,
    pub stale_beyond_bound: bool,
    pub stale_sources: Vec<String>,
    /// Time spent waiting for watermarks, in ms.
    pub waited_ms: u64,
}

/// Per-query state, logged as the query advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Received,
    WaitingForWatermark,
    BoundToSnapshot,
    Searching,
    Ranked,
    Returned,
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryPhase::Received => "received",
            QueryPhase::WaitingForWatermark => "waiting_for_watermark",
            QueryPhase::BoundToSnapshot => "bound_to_snapshot",
            QueryPhase::Searching => "searching",
            QueryPhase::Ranked => "ranked",
            QueryPhase::Returned => "returned",
        };
        f.write_str(s)
    }
}

/// Engine limits and defaults.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub default_k: usize,
    pub max_k: usize,
    pub default_bound: Duration,
    /// Upper limit on any requested wait.
    pub max_wait: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            default_k: 10,
            max_k: 100,
            default_bound: Duration::from_secs(5),
            max_wait: Duration::from_secs(2),
        }
    }
}

/// Answers queries against the live index.
pub struct QueryEngine {
    index: IncrementalIndex,
    watermarks: Arc<WatermarkTracker>,
    embedding: Arc<EmbeddingStage>,
    options: QueryOptions,
}

impl QueryEngine {
    pub fn new(
        index: IncrementalIndex,
        watermarks: Arc<WatermarkTracker>,
        embedding: Arc<EmbeddingStage>,
        options: QueryOptions,
    ) -> Self {
        Self {
            index,
            watermarks,
            embedding,
            options,
        }
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub async fn query(&self, req: &QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        self.phase(QueryPhase::Received);

        let k = req.k.unwrap_or(self.options.default_k);
        if k == 0 || k > self.options.max_k {
            return Err(Error::InvalidQuery(format!(
                "k must be between 1 and {}, got {}",
                self.options.max_k, k
            )));
        }
        req.filter.validate()?;
        let vector = match &req.input {
            QueryInput::Text(text) => self.embedding.embed_query(text).await?,
            QueryInput::Vector(v) => {
                if v.len() != self.index.dims() {
                    return Err(Error::InvalidQuery(format!(
                        "query vector has {} dims, index expects {}",
                        v.len(),
                        self.index.dims()
                    )));
                }
                v.clone()
            }
        };

        let bound = req
            .consistency_bound_ms
            .map(Duration::from_millis)
            .unwrap_or(self.options.default_bound);
        let max_wait = req
            .max_wait_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO)
            .min(self.options.max_wait);
        let required = self.required_sources(&req.filter);

        let wait_started = Instant::now();
        if !max_wait.is_zero()
            && !self
                .stale_sources(&required, bound, self.index.visible_clock())
                .is_empty()
        {
            self.phase(QueryPhase::WaitingForWatermark);
            let fresh = tokio::time::timeout(max_wait, self.wait_until_fresh(&required, bound))
                .await
                .is_ok();
            tracing::debug!(fresh, waited_ms = wait_started.elapsed().as_millis() as u64, "watermark wait ended");
        }
        let waited_ms = wait_started.elapsed().as_millis() as u64;

        let snapshot = self.index.snapshot();
        self.phase(QueryPhase::BoundToSnapshot);
        let stale_sources = self.stale_sources(&required, bound, snapshot.clock());
        let now = Utc::now();
        let per_source_lag: BTreeMap<String, u64> = required
            .iter()
            .filter_map(|s| {
                self.watermarks
                    .lag_at(s, now)
                    .map(|lag| (s.clone(), lag.as_millis() as u64))
            })
            .collect();

        self.phase(QueryPhase::Searching);
        let hits = snapshot.search(&vector, k, &req.filter)?;
        self.phase(QueryPhase::Ranked);
        let results = hits
            .into_iter()
            .map(|h| QueryResult {
                doc_id: h.doc_id,
                score: h.score,
                source_id: h.document.source_id.clone(),
                external_id: h.document.external_id.clone(),
                version: h.document.version,
                version_applied: h.document.version_applied,
                fields: h.document.structured_fields.clone(),
                text: h.document.payload_text.to_string(),
                observed_at: h.document.observed_at,
            })
            .collect::<Vec<_>>();

        let response = QueryResponse {
            snapshot_clock: snapshot.clock(),
            stale_beyond_bound: !stale_sources.is_empty(),
            results,
            per_source_lag,
            stale_sources,
            waited_ms,
        };
        self.phase(QueryPhase::Returned);
        tracing::info!(
            clock = response.snapshot_clock.value(),
            results = response.results.len(),
            stale = response.stale_beyond_bound,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query answered"
        );
        Ok(response)
    }

    /// Search an explicit snapshot, bypassing staleness handling. Used for
    /// repeatable reads at a fixed clock.
    pub async fn query_snapshot(
        &self,
        snapshot: &Snapshot,
        input: &QueryInput,
        k: usize,
        filter: &Filter,
    ) -> Result<Vec<QueryResult>> {
        if k > self.options.max_k {
            return Err(Error::InvalidQuery(format!(
                "k must be at most {}",
                self.options.max_k
            )));
        }
        let vector = match input {
            QueryInput::Text(t) => self.embedding.embed_query(t).await?,
            QueryInput::Vector(v) => v.clone(),
        };
        Ok(snapshot
            .search(&vector, k, filter)?
            .into_iter()
            .map(|h| QueryResult {
                doc_id: h.doc_id,
                score: h.score,
                source_id: h.document.source_id.clone(),
                external_id: h.document.external_id.clone(),
                version: h.document.version,
                version_applied: h.document.version_applied,
                fields: h.document.structured_fields.clone(),
                text: h.document.payload_text.to_string(),
                observed_at: h.document.observed_at,
            })
            .collect())
    }

    fn required_sources(&self, filter: &Filter) -> Vec<String> {
        if filter.sources.is_empty() {
            self.watermarks.source_ids()
        } else {
            let mut s = filter.sources.clone();
            s.sort();
            s.dedup();
            s
        }
    }

    /// Sources whose lag exceeds `bound`, whose last clock is above
    /// `visible`, or which never had anything applied.
    fn stale_sources(&self, required: &[String], bound: Duration, visible: LogicalClock) -> Vec<String> {
        let now = Utc::now();
        required
            .iter()
            .filter(|s| match self.watermarks.get(s) {
                None => true,
                Some(wm) => match wm.lag_at(now) {
                    None => true,
                    Some(lag) => lag > bound || wm.last_clock > visible,
                },
            })
            .cloned()
            .collect()
    }

    async fn wait_until_fresh(&self, required: &[String], bound: Duration) {
        let mut visible_rx = self.index.subscribe_visible();
        let mut wm_rx = self.watermarks.subscribe();
        loop {
            if self
                .stale_sources(required, bound, self.index.visible_clock())
                .is_empty()
            {
                return;
            }
            tokio::select! {
                r = visible_rx.changed() => if r.is_err() { return },
                r = wm_rx.changed() => if r.is_err() { return },
            }
        }
    }

    fn phase(&self, phase: QueryPhase) {
        tracing::trace!(%phase, "query phase");
    }
}
