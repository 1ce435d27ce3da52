//! Producer trait and registry.
//!
//! A producer polls one upstream system (a market-data feed, a news wire,
//! a sanctions list, a document folder) and returns new [`SourceRecord`]s.
//! Everything a producer returns flows through the same pipeline:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             ProducerRegistry             │
//! │  ┌──────────┐ ┌───────────┐ ┌─────────┐  │
//! │  │ JSONL    │ │ Document  │ │ Custom  │  │
//! │  │ feeds    │ │ folders   │ │ (Rust)  │  │
//! │  └──────────┘ └───────────┘ └─────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!   Pipeline::submit_record → normalize → embed → sequence
//! ```
//!
//! # Usage
//!
//! ```rust
//! use fintech_rag::traits::ProducerRegistry;
//!
//! let mut producers = ProducerRegistry::new();
//! // producers.register(std::sync::Arc::new(MyProducer::new()));
//! assert!(producers.is_empty());
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use fintech_rag_core::normalize::SourceRecord;

use crate::config::Config;

/// A source of change records.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use chrono::Utc;
/// use fintech_rag::traits::Producer;
/// use fintech_rag_core::normalize::SourceRecord;
///
/// pub struct FxRates;
///
/// #[async_trait]
/// impl Producer for FxRates {
///     fn name(&self) -> &str { "fx" }
///     fn description(&self) -> &str { "ECB reference rates" }
///
///     async fn poll(&self) -> Result<Vec<SourceRecord>> {
///         Ok(vec![SourceRecord::MarketTick {
///             symbol: "EURUSD".into(),
///             price: 1.0842,
///             volume: None,
///             currency: Some("USD".into()),
///             exchange: None,
///             ts: Utc::now(),
///         }])
///     }
/// }
/// ```
#[async_trait]
pub trait Producer: Send + Sync {
    /// Source id stamped on every event this producer emits.
    fn name(&self) -> &str;

    /// One-line description, shown by `frag sources`.
    fn description(&self) -> &str;

    /// Producer type (e.g. `"feed"`, `"documents"`, `"custom"`).
    fn kind(&self) -> &str {
        "custom"
    }

    /// Delay between two polls when running continuously.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Return records that appeared since the previous poll.
    ///
    /// An empty vector means nothing new. Errors are logged by the caller
    /// and the producer is polled again after its interval.
    async fn poll(&self) -> Result<Vec<SourceRecord>>;
}

/// The set of producers a running index ingests from.
#[derive(Default)]
pub struct ProducerRegistry {
    producers: Vec<Arc<dyn Producer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one built-in producer per configured source.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::connector_feed::FeedProducer;
        use crate::connector_fs::DocumentProducer;

        let mut registry = Self::new();
        for (name, cfg) in &config.sources.feeds {
            registry.register(Arc::new(FeedProducer::new(name.clone(), cfg.clone())));
        }
        for (name, cfg) in &config.sources.documents {
            registry.register(Arc::new(DocumentProducer::new(
                name.clone(),
                cfg.clone(),
                config.normalizer.chunk_max_tokens,
            )?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, producer: Arc<dyn Producer>) {
        self.producers.push(producer);
    }

    pub fn producers(&self) -> &[Arc<dyn Producer>] {
        &self.producers
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Producer>> {
        self.producers.iter().find(|p| p.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.producers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}
