//! Error types for the live index core.
//!
//! [`Error`] covers every rejection the write and read paths can produce.
//! Two conditions from the design are deliberately absent:
//!
//! - *stale beyond bound* is a flag on a returned
//!   [`QueryResponse`](crate::query::QueryResponse), not an error.
//! - a compaction race has no variant: the epoch registry makes it
//!   unrepresentable (see [`crate::index::snapshot`]).

use crate::models::{DocId, LogicalClock};

/// Error type for ingestion, indexing and query operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The event's content hash equals the currently visible version of the
    /// document (or a delete targets an absent document). Informational: the
    /// event is dropped and the index is unchanged.
    #[error("duplicate event for {doc_id} (content hash {content_hash})")]
    DuplicateEvent { doc_id: DocId, content_hash: String },

    /// A retried event was overtaken: the document has been written since
    /// the event first failed, so re-applying it would rewind newer state.
    /// The event is discarded and the index is unchanged.
    #[error("event for {doc_id} superseded (expected head {expected}, found {head})")]
    Superseded {
        doc_id: DocId,
        expected: LogicalClock,
        head: LogicalClock,
    },

    /// The payload could not be embedded. The event was not sequenced and
    /// must be routed back to the normalizer for a retry/drop decision.
    #[error("embedding failed for {doc_id}: {reason}")]
    EmbeddingFailed { doc_id: DocId, reason: String },

    /// Malformed structured fields, wrong vector dimension or an identity
    /// that cannot be indexed. Rejected before any state changes.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// The embedding provider could not vectorize query text. The input may
    /// be fine; the query can be retried once the provider recovers.
    #[error("query embedding failed: {0}")]
    QueryEmbeddingFailed(String),

    /// Malformed query input (k out of range, wrong vector dimension,
    /// empty text, malformed filter).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The commit log refused the record. The event was not applied and its
    /// clock value was not consumed.
    #[error("commit log error: {0}")]
    Log(String),
}

impl Error {
    /// True for outcomes that are expected during normal operation and
    /// should not be surfaced to producers as failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::DuplicateEvent { .. } | Error::Superseded { .. })
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_benign() {
        let err = Error::DuplicateEvent {
            doc_id: DocId::new("news", "n-1"),
            content_hash: "abc".to_string(),
        };
        assert!(err.is_benign());
        assert!(Error::Superseded {
            doc_id: DocId::new("sanctions", "OFAC:E-1"),
            expected: LogicalClock(1),
            head: LogicalClock(2),
        }
        .is_benign());
        assert!(!Error::InvalidDocument("x".into()).is_benign());
    }

    #[test]
    fn display_includes_doc_id() {
        let err = Error::EmbeddingFailed {
            doc_id: DocId::new("docs", "q3.pdf#chunk0"),
            reason: "payload too large".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("docs/q3.pdf#chunk0"), "{msg}");
        assert!(msg.contains("payload too large"));
    }
}
