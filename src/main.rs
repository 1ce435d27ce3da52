//! # Fintech RAG CLI (`frag`)
//!
//! ## Usage
//!
//! ```bash
//! frag --config ./config/frag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `frag ingest <file> --source <id>` | Submit a JSON-lines file of source records |
//! | `frag query "<text>"` | Retrieve from a consistent snapshot with staleness report |
//! | `frag stats` | Clocks, index size, compaction and per-source freshness |
//! | `frag sources` | List configured sources and their health |
//! | `frag run` | Ingest continuously from configured sources until Ctrl-C |
//!
//! ## Examples
//!
//! ```bash
//! # One-shot load of a sanctions delta file
//! frag ingest ./drops/ofac-2024-05-01.jsonl --source sanctions
//!
//! # Only news, at most 2 s behind, wait up to 500 ms for fresher data
//! frag query "rate decision" --source news --bound-secs 2 --wait-ms 500
//!
//! # Structured filter
//! frag query "earnings" --filter ticker=AAPL --filter "price>=150" --json
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use fintech_rag::config;
use fintech_rag::ingest;
use fintech_rag::logging;
use fintech_rag::query::{self, QueryArgs};
use fintech_rag::service::LiveIndex;
use fintech_rag::sources;
use fintech_rag::stats;
use fintech_rag::traits::ProducerRegistry;

/// Fintech RAG: a live incremental retrieval index.
#[derive(Parser)]
#[command(name = "frag", version, about)]
struct Cli {
    /// Path to configuration file.
    #[arg(long, global = true, default_value = "./config/frag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit every record of a JSON-lines file.
    ///
    /// Each line is one source record (`market_tick`, `news_article`,
    /// `sanctions_delta`, `document`, `document_removed` or `row`).
    /// Malformed lines are skipped with a warning.
    Ingest {
        /// Path to the `.jsonl` file.
        path: PathBuf,

        /// Source id stamped on every event.
        #[arg(long)]
        source: String,
    },

    /// Query the index.
    ///
    /// Results come from one consistent snapshot. Sources whose data is older
    /// than the bound are reported as stale; the query still answers.
    Query {
        /// Query text.
        text: String,

        /// Number of results.
        #[arg(long)]
        k: Option<usize>,

        /// Restrict to a source (repeatable).
        #[arg(long)]
        source: Vec<String>,

        /// Structured filter such as `ticker=AAPL`, `list=OFAC|EU` or
        /// `price>=100` (repeatable).
        #[arg(long)]
        filter: Vec<String>,

        /// Consistency bound in seconds (default from config).
        #[arg(long)]
        bound_secs: Option<f64>,

        /// Wait up to this many milliseconds for stale sources to catch up.
        #[arg(long)]
        wait_ms: Option<u64>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index and freshness statistics.
    Stats {
        /// Print the metrics snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List configured sources.
    Sources,

    /// Ingest continuously from all configured sources.
    ///
    /// Polls every feed and document source, retries failed embeddings and
    /// compacts in the background until Ctrl-C.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Ingest { path, source } => {
            ingest::run_ingest(&cfg, &path, &source).await?;
        }
        Commands::Query {
            text,
            k,
            source,
            filter,
            bound_secs,
            wait_ms,
            json,
        } => {
            let args = QueryArgs {
                text,
                k,
                sources: source,
                filters: filter,
                bound_secs,
                wait_ms,
                json,
            };
            query::run_query(&cfg, &args).await?;
        }
        Commands::Stats { json } => {
            stats::run_stats(&cfg, json).await?;
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Run => {
            let producers = ProducerRegistry::from_config(&cfg)?;
            if producers.is_empty() {
                anyhow::bail!("no sources configured; add [sources.feeds.<name>] or [sources.documents.<name>]");
            }
            let live = std::sync::Arc::new(LiveIndex::open(&cfg).await?);
            let replay = live.replay_stats();
            tracing::info!(
                records = replay.records,
                clock = replay.last_clock.value(),
                sources = producers.len(),
                "live index ready"
            );
            let summary = live
                .run_until(producers, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "failed to listen for Ctrl-C");
                    }
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
