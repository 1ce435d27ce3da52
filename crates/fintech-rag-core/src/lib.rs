//! # Fintech RAG Core
//!
//! The live incremental retrieval index: change events, embedding stage,
//! sequencer, multi-version index, watermark tracking and query engine.
//!
//! This crate performs no filesystem or network I/O. Durable logging,
//! remote embedding providers, connectors and the CLI live in the
//! `fintech-rag` application crate.
//!
//! ```text
//! SourceRecord ─► Normalizer ─► EmbeddingStage ─► Sequencer ─► IncrementalIndex
//!                     ▲               │               │              ▲
//!                     └─ retry/drop ◄─┘               ▼              │
//!                                              WatermarkTracker ◄── QueryEngine
//! ```

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod log;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod query;
pub mod sequencer;
pub mod watermark;

pub use error::{Error, Result};
