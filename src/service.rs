//! The assembled live index.
//!
//! [`LiveIndex`] wires the core components together from a [`Config`]:
//!
//! 1. open the commit log and replay it into a fresh index,
//! 2. build the embedding stage, normalizer, sequencer and query engine,
//! 3. optionally run producers, the embedding retry pass and the background
//!    compactor until shutdown.
//!
//! Compaction uses the global watermark (the lowest clock every source has
//! reached) as its in-use bound; live snapshots and the visible clock bound
//! it further inside the index.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use fintech_rag_core::embedding::{Embedder, EmbeddingStage};
use fintech_rag_core::index::{CompactionStats, IncrementalIndex};
use fintech_rag_core::log::{CommitLog, NullLog};
use fintech_rag_core::metrics::MetricsSnapshot;
use fintech_rag_core::normalize::{Normalizer, SourceRecord};
use fintech_rag_core::query::{QueryEngine, QueryRequest, QueryResponse};
use fintech_rag_core::sequencer::{ReplayStats, Sequencer};
use fintech_rag_core::watermark::WatermarkTracker;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::ingest::{EventOutcome, IngestSummary, Pipeline};
use crate::traits::{Producer, ProducerRegistry};
use crate::wal::JsonlWal;

const RETRY_PASS_INTERVAL: Duration = Duration::from_millis(500);

pub struct LiveIndex {
    config: Config,
    pipeline: Pipeline,
    query: QueryEngine,
    log: Arc<dyn CommitLog>,
    replay: ReplayStats,
}

/// Totals of a [`LiveIndex::run_until`] session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub ingest: IngestSummary,
    pub poll_errors: usize,
    pub compactions: usize,
}

impl LiveIndex {
    /// Open with the embedder named in `[embedding]`.
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding, config.index.dims)?;
        Self::open_with_embedder(config, embedder).await
    }

    pub async fn open_with_embedder(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        if embedder.dims() != config.index.dims {
            anyhow::bail!(
                "embedder '{}' produces {} dims, index expects {}",
                embedder.model_name(),
                embedder.dims(),
                config.index.dims
            );
        }

        let index = IncrementalIndex::new(config.index.dims);
        let watermarks = Arc::new(WatermarkTracker::new());
        for name in config.sources.names() {
            watermarks.register_source(&name);
        }

        let (log, records) = match &config.index.wal_path {
            Some(path) => {
                let (wal, contents) = JsonlWal::open(path, config.index.fsync)?;
                (Arc::new(wal) as Arc<dyn CommitLog>, contents.records)
            }
            None => (Arc::new(NullLog) as Arc<dyn CommitLog>, Vec::new()),
        };

        let sequencer = Arc::new(Sequencer::new(index.clone(), log.clone(), watermarks.clone()));
        let replay = sequencer
            .replay(records)
            .await
            .context("Failed to replay commit log")?;

        let embedding = Arc::new(EmbeddingStage::new(
            embedder,
            config.embedding.stage_options(),
        ));
        let normalizer = Arc::new(Normalizer::new(config.normalizer.options()));
        let query = QueryEngine::new(
            index,
            watermarks,
            embedding.clone(),
            config.query.options(),
        );

        Ok(Self {
            config: config.clone(),
            pipeline: Pipeline::new(normalizer, embedding, sequencer),
            query,
            log,
            replay,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        self.pipeline.sequencer()
    }

    pub fn index(&self) -> &IncrementalIndex {
        self.pipeline.sequencer().index()
    }

    pub fn watermarks(&self) -> &Arc<WatermarkTracker> {
        self.pipeline.sequencer().watermarks()
    }

    /// Statistics of the startup replay.
    pub fn replay_stats(&self) -> ReplayStats {
        self.replay
    }

    pub async fn submit_record(
        &self,
        source_id: &str,
        record: SourceRecord,
    ) -> Result<Vec<EventOutcome>> {
        self.pipeline.submit_record(source_id, record).await
    }

    pub async fn query(&self, req: &QueryRequest) -> Result<QueryResponse> {
        Ok(self.query.query(req).await?)
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.query
    }

    /// One compaction pass bounded by the global watermark.
    pub fn compact(&self) -> CompactionStats {
        let index = self.index();
        let min_in_use = self
            .watermarks()
            .global_watermark()
            .unwrap_or_else(|| index.visible_clock());
        index.compact(min_in_use)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot::collect(
            self.sequencer(),
            self.pipeline.embedding(),
            self.pipeline.normalizer(),
        )
    }

    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }

    /// Poll every producer, run retries and compaction until `shutdown`
    /// resolves. Each producer gets its own task; records of one producer
    /// are submitted in the order it returned them.
    pub async fn run_until<F>(
        self: Arc<Self>,
        producers: ProducerRegistry,
        shutdown: F,
    ) -> Result<RunSummary>
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: JoinSet<Result<RunSummary>> = JoinSet::new();

        for producer in producers.producers() {
            tracing::info!(source = producer.name(), kind = producer.kind(), "starting producer");
            tasks.spawn(produce(self.clone(), producer.clone(), stop_rx.clone()));
        }
        tasks.spawn(retry_loop(self.clone(), stop_rx.clone()));
        tasks.spawn(compaction_loop(self.clone(), stop_rx));

        shutdown.await;
        tracing::info!("shutdown requested");
        let _ = stop_tx.send(true);

        let mut summary = RunSummary::default();
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.context("ingestion task panicked")? {
                Ok(part) => {
                    summary.ingest.merge(&part.ingest);
                    summary.poll_errors += part.poll_errors;
                    summary.compactions += part.compactions;
                }
                Err(e) => {
                    tracing::error!(error = %e, "ingestion task failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        self.flush()?;
        match first_err {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// Sleep for `period` unless shutdown is signalled first. Returns false on
/// shutdown.
async fn pause(period: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = stop.changed() => false,
    }
}

async fn produce(
    live: Arc<LiveIndex>,
    producer: Arc<dyn Producer>,
    mut stop: watch::Receiver<bool>,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let source = producer.name().to_string();

    loop {
        match producer.poll().await {
            Ok(records) => {
                for record in records {
                    summary.ingest.records += 1;
                    let outcomes = live.submit_record(&source, record).await?;
                    summary.ingest.extend(&outcomes);
                }
            }
            Err(e) => {
                summary.poll_errors += 1;
                tracing::warn!(source = %source, error = %e, "producer poll failed");
            }
        }
        if !pause(producer.poll_interval(), &mut stop).await {
            break;
        }
    }

    tracing::info!(
        source = %source,
        records = summary.ingest.records,
        applied = summary.ingest.applied,
        "producer stopped"
    );
    Ok(summary)
}

async fn retry_loop(live: Arc<LiveIndex>, mut stop: watch::Receiver<bool>) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    while pause(RETRY_PASS_INTERVAL, &mut stop).await {
        let outcomes = live.pipeline().retry_due(Utc::now()).await?;
        summary.ingest.extend(&outcomes);
    }
    Ok(summary)
}

async fn compaction_loop(
    live: Arc<LiveIndex>,
    mut stop: watch::Receiver<bool>,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let period = Duration::from_secs(live.config().index.compaction_interval_secs.max(1));
    while pause(period, &mut stop).await {
        live.compact();
        summary.compactions += 1;
    }
    Ok(summary)
}
