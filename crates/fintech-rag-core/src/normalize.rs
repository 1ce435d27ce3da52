//! Change event normalizer.
//!
//! Converts heterogeneous [`SourceRecord`]s into uniform [`ChangeEvent`]s
//! and decides what happens to events whose embedding failed.
//!
//! # Record kinds
//!
//! | Kind | External id | Events |
//! |------|-------------|--------|
//! | `market_tick` | symbol | one upsert (latest tick wins) |
//! | `news_article` | article id | one upsert |
//! | `sanctions_delta` | `{list}:{entity_id}` | upsert, or delete on `remove` |
//! | `document` | `{path}#chunk{n}` | one upsert per chunk, deletes for vanished chunks |
//! | `document_removed` | `{path}#chunk{n}` | one delete per chunk |
//! | `row` | `{table}:{key}` | one upsert |
//!
//! # Retry / drop
//!
//! An event whose embedding failed is handed back through
//! [`Normalizer::report_embedding_failure`]. Attempts are counted per
//! `(doc_id, content_hash)`; the event is rescheduled with exponential
//! backoff until `max_embedding_attempts` is reached, then dropped. Either
//! way the decision is returned to the caller, so no event disappears
//! without a trace.
//!
//! The ledger holds at most one pending retry per document. A later failure
//! for the same document replaces it, and any event for the document that
//! reaches the sequencer settles it. Each pending retry also remembers the
//! document's head clock at failure time, which the sequencer checks before
//! re-applying it, so a retry can never overwrite newer state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::chunk::chunk_text;
use crate::error::{Error, Result};
use crate::models::{ChangeEvent, DocId, Fields, LogicalClock, Scalar};

/// What a sanctions-list delta does to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanctionsAction {
    Add,
    Update,
    Remove,
}

/// A record as emitted by a producer, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRecord {
    MarketTick {
        symbol: String,
        price: f64,
        #[serde(default)]
        volume: Option<i64>,
        #[serde(default)]
        currency: Option<String>,
        #[serde(default)]
        exchange: Option<String>,
        ts: DateTime<Utc>,
    },
    NewsArticle {
        id: String,
        headline: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        tickers: Vec<String>,
        #[serde(default)]
        publisher: Option<String>,
        published_at: DateTime<Utc>,
    },
    SanctionsDelta {
        entity_id: String,
        name: String,
        list: String,
        #[serde(default)]
        program: Option<String>,
        #[serde(default)]
        aliases: Vec<String>,
        #[serde(default)]
        country: Option<String>,
        action: SanctionsAction,
        listed_at: DateTime<Utc>,
    },
    Document {
        path: String,
        text: String,
        #[serde(default)]
        title: Option<String>,
        modified_at: DateTime<Utc>,
        /// Chunk count of the previously indexed revision, if any.
        #[serde(default)]
        previous_chunks: usize,
    },
    DocumentRemoved {
        path: String,
        chunk_count: usize,
        #[serde(default)]
        removed_at: Option<DateTime<Utc>>,
    },
    Row {
        table: String,
        key: String,
        #[serde(default)]
        columns: Fields,
        #[serde(default)]
        updated_at: Option<DateTime<Utc>>,
    },
}

impl SourceRecord {
    /// Short kind name, as used in the JSON `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceRecord::MarketTick { .. } => "market_tick",
            SourceRecord::NewsArticle { .. } => "news_article",
            SourceRecord::SanctionsDelta { .. } => "sanctions_delta",
            SourceRecord::Document { .. } => "document",
            SourceRecord::DocumentRemoved { .. } => "document_removed",
            SourceRecord::Row { .. } => "row",
        }
    }
}

/// External id of chunk `index` of the document at `path`.
pub fn chunk_external_id(path: &str, index: usize) -> String {
    format!("{}#chunk{}", path, index)
}

/// Normalizer settings.
#[derive(Debug, Clone)]
pub struct NormalizerOptions {
    pub chunk_max_tokens: usize,
    pub max_embedding_attempts: u32,
    /// Delay before the first retry; doubled per attempt.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            chunk_max_tokens: 700,
            max_embedding_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(32),
        }
    }
}

/// Outcome of reporting an embedding failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    Retry {
        attempt: u32,
        not_before: DateTime<Utc>,
    },
    Drop {
        attempts: u32,
    },
}

/// An event waiting for another embedding attempt.
#[derive(Debug, Clone)]
pub struct PendingRetry {
    pub event: ChangeEvent,
    /// Last clock applied to the document when the event first failed.
    pub head_clock: LogicalClock,
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
    pub last_error: String,
}

#[derive(Debug, Default)]
struct RetryState {
    attempts: HashMap<(DocId, String), u32>,
    pending: Vec<PendingRetry>,
}

/// Stateless record conversion plus the retry ledger.
#[derive(Debug, Default)]
pub struct Normalizer {
    options: NormalizerOptions,
    retries: Mutex<RetryState>,
}

impl Normalizer {
    pub fn new(options: NormalizerOptions) -> Self {
        Self {
            options,
            retries: Mutex::new(RetryState::default()),
        }
    }

    pub fn options(&self) -> &NormalizerOptions {
        &self.options
    }

    /// Convert one record from `source_id` into change events.
    pub fn normalize(
        &self,
        source_id: &str,
        record: SourceRecord,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<ChangeEvent>> {
        let events = match record {
            SourceRecord::MarketTick {
                symbol,
                price,
                volume,
                currency,
                exchange,
                ts,
            } => {
                let symbol = symbol.trim().to_uppercase();
                require("symbol", &symbol)?;
                if !price.is_finite() {
                    return Err(Error::InvalidDocument(format!(
                        "tick for {} has a non-finite price",
                        symbol
                    )));
                }
                let mut fields = Fields::new();
                fields.insert("symbol".into(), Scalar::Str(symbol.clone()));
                fields.insert("price".into(), Scalar::Float(price));
                fields.insert("ts".into(), Scalar::Str(ts.to_rfc3339()));
                insert_opt(&mut fields, "volume", volume.map(Scalar::Int));
                insert_opt(&mut fields, "currency", currency.clone().map(Scalar::Str));
                insert_opt(&mut fields, "exchange", exchange.clone().map(Scalar::Str));

                let mut text = format!("{} last traded at {}", symbol, price);
                if let Some(c) = &currency {
                    text.push_str(&format!(" {}", c));
                }
                if let Some(x) = &exchange {
                    text.push_str(&format!(" on {}", x));
                }
                if let Some(v) = volume {
                    text.push_str(&format!(", volume {}", v));
                }
                vec![ChangeEvent::upsert(
                    source_id, &symbol, text, fields, ts, received_at,
                )]
            }

            SourceRecord::NewsArticle {
                id,
                headline,
                body,
                tickers,
                publisher,
                published_at,
            } => {
                require("id", &id)?;
                if headline.trim().is_empty() && body.trim().is_empty() {
                    return Err(Error::InvalidDocument(format!(
                        "article {} has neither headline nor body",
                        id
                    )));
                }
                let tickers: Vec<String> = tickers
                    .iter()
                    .map(|t| t.trim().to_uppercase())
                    .filter(|t| !t.is_empty())
                    .collect();
                let mut fields = Fields::new();
                fields.insert("headline".into(), Scalar::Str(headline.trim().to_string()));
                fields.insert("published_at".into(), Scalar::Str(published_at.to_rfc3339()));
                if !tickers.is_empty() {
                    fields.insert("tickers".into(), Scalar::Str(tickers.join(",")));
                    fields.insert("primary_ticker".into(), Scalar::Str(tickers[0].clone()));
                }
                insert_opt(&mut fields, "publisher", publisher.map(Scalar::Str));

                let text = if body.trim().is_empty() {
                    headline.trim().to_string()
                } else {
                    format!("{}\n\n{}", headline.trim(), body.trim())
                };
                vec![ChangeEvent::upsert(
                    source_id,
                    id.trim(),
                    text,
                    fields,
                    published_at,
                    received_at,
                )]
            }

            SourceRecord::SanctionsDelta {
                entity_id,
                name,
                list,
                program,
                aliases,
                country,
                action,
                listed_at,
            } => {
                require("entity_id", &entity_id)?;
                require("list", &list)?;
                let external_id = format!("{}:{}", list.trim(), entity_id.trim());
                if action == SanctionsAction::Remove {
                    vec![ChangeEvent::delete(
                        source_id,
                        external_id,
                        listed_at,
                        received_at,
                    )]
                } else {
                    require("name", &name)?;
                    let mut fields = Fields::new();
                    fields.insert("entity_id".into(), Scalar::Str(entity_id.trim().to_string()));
                    fields.insert("name".into(), Scalar::Str(name.trim().to_string()));
                    fields.insert("list".into(), Scalar::Str(list.trim().to_string()));
                    fields.insert("listed_at".into(), Scalar::Str(listed_at.to_rfc3339()));
                    insert_opt(&mut fields, "program", program.clone().map(Scalar::Str));
                    insert_opt(&mut fields, "country", country.clone().map(Scalar::Str));

                    let mut text = name.trim().to_string();
                    if !aliases.is_empty() {
                        text.push_str(&format!(" (also known as {})", aliases.join(", ")));
                    }
                    text.push_str(&format!(" is listed on {}", list.trim()));
                    if let Some(p) = &program {
                        text.push_str(&format!(" under program {}", p));
                    }
                    if let Some(c) = &country {
                        text.push_str(&format!(", country {}", c));
                    }
                    vec![ChangeEvent::upsert(
                        source_id,
                        external_id,
                        text,
                        fields,
                        listed_at,
                        received_at,
                    )]
                }
            }

            SourceRecord::Document {
                path,
                text,
                title,
                modified_at,
                previous_chunks,
            } => {
                require("path", &path)?;
                let chunks = chunk_text(&text, self.options.chunk_max_tokens);
                let count = chunks.len();
                let mut events = Vec::with_capacity(count.max(previous_chunks));
                for chunk in chunks {
                    let mut fields = Fields::new();
                    fields.insert("path".into(), Scalar::Str(path.clone()));
                    fields.insert("chunk_index".into(), Scalar::Int(chunk.index as i64));
                    fields.insert("chunk_count".into(), Scalar::Int(count as i64));
                    fields.insert("modified_at".into(), Scalar::Str(modified_at.to_rfc3339()));
                    insert_opt(&mut fields, "title", title.clone().map(Scalar::Str));
                    events.push(ChangeEvent::upsert(
                        source_id,
                        chunk_external_id(&path, chunk.index),
                        chunk.text,
                        fields,
                        modified_at,
                        received_at,
                    ));
                }
                for index in count..previous_chunks {
                    events.push(ChangeEvent::delete(
                        source_id,
                        chunk_external_id(&path, index),
                        modified_at,
                        received_at,
                    ));
                }
                events
            }

            SourceRecord::DocumentRemoved {
                path,
                chunk_count,
                removed_at,
            } => {
                require("path", &path)?;
                let at = removed_at.unwrap_or(received_at);
                (0..chunk_count)
                    .map(|i| ChangeEvent::delete(source_id, chunk_external_id(&path, i), at, received_at))
                    .collect()
            }

            SourceRecord::Row {
                table,
                key,
                columns,
                updated_at,
            } => {
                require("table", &table)?;
                require("key", &key)?;
                let mut text = format!("{} {}:", table, key);
                for (name, value) in &columns {
                    text.push_str(&format!(" {}={};", name, value));
                }
                let mut fields = columns;
                fields.insert("table".into(), Scalar::Str(table.clone()));
                vec![ChangeEvent::upsert(
                    source_id,
                    format!("{}:{}", table, key),
                    text,
                    fields,
                    updated_at.unwrap_or(received_at),
                    received_at,
                )]
            }
        };

        for event in &events {
            event.validate()?;
        }
        Ok(events)
    }

    /// Decide whether an event whose embedding failed is retried or dropped.
    ///
    /// `head_clock` is the document's last applied clock as the event saw it.
    pub fn report_embedding_failure(
        &self,
        event: ChangeEvent,
        head_clock: LogicalClock,
        reason: &str,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let doc_id = event.doc_id();
        let key = (doc_id.clone(), event.content_hash.clone());
        let mut state = self.retries.lock();
        // older revisions of this document are superseded by this one
        state.attempts.retain(|(d, h), _| d != &doc_id || h == &key.1);
        state.pending.retain(|p| p.event.doc_id() != doc_id);

        let attempts = {
            let n = state.attempts.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };

        if attempts >= self.options.max_embedding_attempts {
            state.attempts.remove(&key);
            tracing::warn!(
                doc_id = %doc_id,
                attempts,
                reason,
                "embedding failed permanently, event dropped"
            );
            return RetryDecision::Drop { attempts };
        }

        let delay = self.backoff(attempts);
        let not_before = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        tracing::warn!(
            doc_id = %doc_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "embedding failed, retry scheduled"
        );
        state.pending.push(PendingRetry {
            event,
            head_clock,
            attempts,
            not_before,
            last_error: reason.to_string(),
        });
        RetryDecision::Retry {
            attempt: attempts,
            not_before,
        }
    }

    /// An event for `doc_id` reached the sequencer (applied, duplicate or
    /// superseded). Pending retries and attempt counts for the document are
    /// obsolete from here on.
    pub fn settle(&self, doc_id: &DocId) {
        let mut state = self.retries.lock();
        state.attempts.retain(|(d, _), _| d != doc_id);
        let before = state.pending.len();
        state.pending.retain(|p| &p.event.doc_id() != doc_id);
        if state.pending.len() < before {
            tracing::debug!(doc_id = %doc_id, "pending retry superseded");
        }
    }

    /// Remove and return retries whose backoff has elapsed at `now`.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<PendingRetry> {
        let mut state = self.retries.lock();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|p| p.not_before <= now);
        state.pending = waiting;
        due
    }

    pub fn pending_retries(&self) -> usize {
        self.retries.lock().pending.len()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(5);
        self.options
            .retry_base_delay
            .saturating_mul(factor)
            .min(self.options.retry_max_delay)
    }
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidDocument(format!("'{}' is required", name)));
    }
    Ok(())
}

fn insert_opt(fields: &mut Fields, name: &str, value: Option<Scalar>) {
    if let Some(v) = value {
        fields.insert(name.to_string(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;

    fn norm() -> Normalizer {
        Normalizer::new(NormalizerOptions {
            chunk_max_tokens: 5,
            ..NormalizerOptions::default()
        })
    }

    #[test]
    fn test_market_tick_from_json() {
        let rec: SourceRecord = serde_json::from_str(
            r#"{"kind":"market_tick","symbol":"aapl","price":150.0,"currency":"USD","ts":"2026-03-02T14:30:00Z"}"#,
        )
        .unwrap();
        let events = norm().normalize("market", rec, Utc::now()).unwrap();
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.doc_id().as_str(), "market/AAPL");
        assert_eq!(ev.structured_fields["price"], Scalar::Float(150.0));
        assert!(ev.payload_text.contains("AAPL last traded at 150"));
    }

    #[test]
    fn test_same_tick_hashes_equal() {
        let ts = Utc::now();
        let rec = SourceRecord::MarketTick {
            symbol: "MSFT".into(),
            price: 410.5,
            volume: Some(1000),
            currency: None,
            exchange: Some("NASDAQ".into()),
            ts,
        };
        let n = norm();
        let a = n.normalize("market", rec.clone(), Utc::now()).unwrap();
        let b = n.normalize("market", rec, Utc::now()).unwrap();
        assert_eq!(a[0].content_hash, b[0].content_hash);
    }

    #[test]
    fn test_sanctions_remove_is_delete() {
        let rec: SourceRecord = serde_json::from_str(
            r#"{"kind":"sanctions_delta","entity_id":"12345","name":"","list":"OFAC-SDN","action":"remove","listed_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let events = norm().normalize("sanctions", rec, Utc::now()).unwrap();
        assert_eq!(events[0].kind, EventKind::Delete);
        assert_eq!(events[0].external_id, "OFAC-SDN:12345");
    }

    #[test]
    fn test_document_chunks_and_trailing_deletes() {
        let rec = SourceRecord::Document {
            path: "filings/q3.txt".into(),
            text: "Revenue grew.\n\nMargins held.\n\nGuidance raised.".into(),
            title: Some("Q3".into()),
            modified_at: Utc::now(),
            previous_chunks: 5,
        };
        let events = norm().normalize("docs", rec, Utc::now()).unwrap();
        let upserts: Vec<&ChangeEvent> = events.iter().filter(|e| !e.is_delete()).collect();
        let deletes: Vec<&ChangeEvent> = events.iter().filter(|e| e.is_delete()).collect();
        assert_eq!(upserts.len() + deletes.len(), 5);
        assert_eq!(upserts[0].external_id, "filings/q3.txt#chunk0");
        assert_eq!(
            deletes.last().unwrap().external_id,
            "filings/q3.txt#chunk4"
        );
    }

    #[test]
    fn test_document_removed_deletes_every_chunk() {
        let rec = SourceRecord::DocumentRemoved {
            path: "a.md".into(),
            chunk_count: 3,
            removed_at: None,
        };
        let events = norm().normalize("docs", rec, Utc::now()).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(ChangeEvent::is_delete));
    }

    #[test]
    fn test_row_columns_become_fields() {
        let rec: SourceRecord = serde_json::from_str(
            r#"{"kind":"row","table":"accounts","key":"42","columns":{"risk":"high","balance":1200.5}}"#,
        )
        .unwrap();
        let events = norm().normalize("crm", rec, Utc::now()).unwrap();
        let ev = &events[0];
        assert_eq!(ev.external_id, "accounts:42");
        assert_eq!(ev.structured_fields["risk"], Scalar::Str("high".into()));
        assert_eq!(ev.structured_fields["table"], Scalar::Str("accounts".into()));
    }

    #[test]
    fn test_invalid_records_rejected() {
        let bad = SourceRecord::MarketTick {
            symbol: "  ".into(),
            price: 1.0,
            volume: None,
            currency: None,
            exchange: None,
            ts: Utc::now(),
        };
        assert!(matches!(
            norm().normalize("market", bad, Utc::now()),
            Err(Error::InvalidDocument(_))
        ));

        let nan = SourceRecord::MarketTick {
            symbol: "AAPL".into(),
            price: f64::NAN,
            volume: None,
            currency: None,
            exchange: None,
            ts: Utc::now(),
        };
        assert!(norm().normalize("market", nan, Utc::now()).is_err());
    }

    #[test]
    fn test_retry_then_drop() {
        let n = Normalizer::new(NormalizerOptions {
            max_embedding_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            ..NormalizerOptions::default()
        });
        let now = Utc::now();
        let ev = ChangeEvent::upsert("news", "n1", "text", Fields::new(), now, now);

        let d1 = n.report_embedding_failure(ev.clone(), LogicalClock::ZERO, "timeout", now);
        assert!(matches!(d1, RetryDecision::Retry { attempt: 1, .. }));
        assert!(n.take_due(now).is_empty());

        let due = n.take_due(now + chrono::Duration::seconds(2));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);

        let d2 = n.report_embedding_failure(ev.clone(), LogicalClock::ZERO, "timeout", now);
        match d2 {
            RetryDecision::Retry { attempt, not_before } => {
                assert_eq!(attempt, 2);
                assert_eq!(not_before, now + chrono::Duration::seconds(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(n.pending_retries(), 1);

        let d3 = n.report_embedding_failure(ev, LogicalClock::ZERO, "timeout", now);
        assert_eq!(d3, RetryDecision::Drop { attempts: 3 });
    }

    #[test]
    fn test_success_resets_attempts() {
        let n = Normalizer::new(NormalizerOptions {
            max_embedding_attempts: 2,
            ..NormalizerOptions::default()
        });
        let now = Utc::now();
        let ev = ChangeEvent::upsert("news", "n1", "text", Fields::new(), now, now);
        n.report_embedding_failure(ev.clone(), LogicalClock::ZERO, "x", now);
        n.settle(&ev.doc_id());
        assert_eq!(n.pending_retries(), 0);
        assert!(matches!(
            n.report_embedding_failure(ev, LogicalClock::ZERO, "x", now),
            RetryDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_newer_failure_replaces_pending_retry() {
        let n = Normalizer::new(NormalizerOptions::default());
        let now = Utc::now();
        let old = ChangeEvent::upsert("market", "AAPL", "AAPL at 150", Fields::new(), now, now);
        let new = ChangeEvent::upsert("market", "AAPL", "AAPL at 152.3", Fields::new(), now, now);

        n.report_embedding_failure(old, LogicalClock(4), "timeout", now);
        n.report_embedding_failure(new.clone(), LogicalClock(4), "timeout", now);
        assert_eq!(n.pending_retries(), 1);

        let due = n.take_due(now + chrono::Duration::seconds(60));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].event.content_hash, new.content_hash);
        assert_eq!(due[0].head_clock, LogicalClock(4));
        assert_eq!(due[0].attempts, 1);
    }

    #[test]
    fn test_drop_clears_pending_retry() {
        let n = Normalizer::new(NormalizerOptions {
            max_embedding_attempts: 2,
            ..NormalizerOptions::default()
        });
        let now = Utc::now();
        let ev = ChangeEvent::upsert("news", "n1", "text", Fields::new(), now, now);
        n.report_embedding_failure(ev.clone(), LogicalClock::ZERO, "x", now);
        assert_eq!(n.pending_retries(), 1);
        assert_eq!(
            n.report_embedding_failure(ev, LogicalClock::ZERO, "x", now),
            RetryDecision::Drop { attempts: 2 }
        );
        assert_eq!(n.pending_retries(), 0);
    }
}
