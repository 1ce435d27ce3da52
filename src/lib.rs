//! # Fintech RAG
//!
//! A live incremental retrieval index for retrieval-augmented generation
//! over fast-moving financial data: market ticks, news, sanctions-list
//! deltas and research documents.
//!
//! Records stream in from producers, are normalized into change events,
//! embedded, sequenced under a single logical clock and become queryable
//! without a batch rebuild. Queries run against a consistent snapshot and
//! report how stale each source is relative to a caller-supplied bound.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌──────────────────┐
//! │  Producers  │──▶│       Pipeline       │──▶│ IncrementalIndex │
//! │ feeds/docs  │   │ normalize→embed→seq  │   │  MVCC versions   │
//! └─────────────┘   └──────────┬───────────┘   └────────┬─────────┘
//!                              ▼                        │
//!                        ┌──────────┐                   ▼
//!                        │ JSONL    │             ┌──────────┐
//!                        │ WAL      │             │   CLI    │
//!                        └──────────┘             │  (frag)  │
//!                                                 └──────────┘
//! ```
//!
//! The index, sequencer, watermarks and query engine live in the
//! `fintech-rag-core` crate; this crate adds configuration, the commit log,
//! remote embedding providers, producers and the `frag` binary.
//!
//! ## Quick Start
//!
//! ```bash
//! frag ingest ./drops/ticks.jsonl --source market
//! frag query "AAPL guidance" --source news --bound-secs 5
//! frag stats
//! frag run                      # tail configured sources until Ctrl-C
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`embedding`] | OpenAI / Ollama providers and provider selection |
//! | [`wal`] | JSON-lines commit log |
//! | [`traits`] | `Producer` trait and registry |
//! | [`connector_feed`] | JSON-lines feed tailer |
//! | [`connector_fs`] | Watched document directories |
//! | [`ingest`] | Per-event ingestion pipeline |
//! | [`service`] | Assembled live index and run loop |
//! | [`query`] | `frag query` |
//! | [`stats`] | `frag stats` |
//! | [`sources`] | `frag sources` |

pub mod config;
pub mod connector_feed;
pub mod connector_fs;
pub mod embedding;
pub mod ingest;
pub mod logging;
pub mod query;
pub mod service;
pub mod sources;
pub mod stats;
pub mod traits;
pub mod wal;
