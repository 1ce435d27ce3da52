//! Core data models shared by the write and read paths.
//!
//! A [`ChangeEvent`] is what producers hand to the index; an
//! [`IndexedDocument`] is one immutable version of a document inside it.
//! Both are keyed by [`DocId`], and every mutation is stamped with a
//! [`LogicalClock`] value by the sequencer.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Stable document identity derived from `(source_id, external_id)`.
///
/// Rendered as `"{source_id}/{external_id}"`. Ordering is lexicographic on
/// that string, which is what search uses to break score ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    pub fn new(source_id: &str, external_id: &str) -> Self {
        Self(format!("{}/{}", source_id, external_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Monotonic counter totally ordering all index mutations.
///
/// `LogicalClock::ZERO` means "nothing applied yet"; the first sequenced
/// event receives clock 1.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogicalClock(pub u64);

impl LogicalClock {
    pub const ZERO: LogicalClock = LogicalClock(0);

    pub fn next(self) -> LogicalClock {
        LogicalClock(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scalar structured-field value.
///
/// Deserializes from plain JSON scalars. Integers and floats compare
/// numerically with each other, so a filter on `price = 150` matches a
/// stored `150.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Hashable key used by the exact field postings.
    pub fn key(&self) -> ScalarKey {
        match self {
            Scalar::Bool(b) => ScalarKey::Bool(*b),
            Scalar::Str(s) => ScalarKey::Str(s.clone()),
            Scalar::Int(_) | Scalar::Float(_) => {
                let v = self.as_f64().unwrap_or(0.0);
                // -0.0 and 0.0 must land in the same posting list
                let v = if v == 0.0 { 0.0 } else { v };
                ScalarKey::Num(v.to_bits())
            }
        }
    }

    /// Numeric-aware equality.
    pub fn matches(&self, other: &Scalar) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    fn validate(&self, field: &str) -> Result<()> {
        if let Scalar::Float(f) = self {
            if !f.is_finite() {
                return Err(Error::InvalidDocument(format!(
                    "field '{}' holds a non-finite float",
                    field
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

/// Hashable projection of a [`Scalar`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarKey {
    Bool(bool),
    Num(u64),
    Str(String),
}

/// Structured fields attached to an event. `BTreeMap` keeps serialization
/// (and therefore content hashing) deterministic.
pub type Fields = BTreeMap<String, Scalar>;

/// Check field names and values before anything is sequenced.
pub fn validate_fields(fields: &Fields) -> Result<()> {
    for (name, value) in fields {
        if name.trim().is_empty() {
            return Err(Error::InvalidDocument("empty field name".to_string()));
        }
        value.validate(name)?;
    }
    Ok(())
}

/// Whether an event creates/replaces a document or removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Upsert,
    Delete,
}

/// Uniform change event produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_id: String,
    pub external_id: String,
    pub content_hash: String,
    pub payload_text: String,
    pub structured_fields: Fields,
    /// Source-reported timestamp. Never used for ordering.
    pub observed_at: DateTime<Utc>,
    /// Ingestion-side arrival timestamp.
    pub received_at: DateTime<Utc>,
    pub kind: EventKind,
}

impl ChangeEvent {
    /// Build an upsert event, computing its content hash.
    pub fn upsert(
        source_id: impl Into<String>,
        external_id: impl Into<String>,
        payload_text: impl Into<String>,
        structured_fields: Fields,
        observed_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let payload_text = payload_text.into();
        let content_hash = content_hash(EventKind::Upsert, &payload_text, &structured_fields);
        Self {
            source_id: source_id.into(),
            external_id: external_id.into(),
            content_hash,
            payload_text,
            structured_fields,
            observed_at,
            received_at,
            kind: EventKind::Upsert,
        }
    }

    /// Build a tombstone event for `(source_id, external_id)`.
    pub fn delete(
        source_id: impl Into<String>,
        external_id: impl Into<String>,
        observed_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let fields = Fields::new();
        Self {
            source_id: source_id.into(),
            external_id: external_id.into(),
            content_hash: content_hash(EventKind::Delete, "", &fields),
            payload_text: String::new(),
            structured_fields: fields,
            observed_at,
            received_at,
            kind: EventKind::Delete,
        }
    }

    pub fn doc_id(&self) -> DocId {
        DocId::new(&self.source_id, &self.external_id)
    }

    pub fn is_delete(&self) -> bool {
        self.kind == EventKind::Delete
    }

    /// Identity and field checks shared by the sequencer and the normalizer.
    pub fn validate(&self) -> Result<()> {
        if self.source_id.trim().is_empty() || self.external_id.trim().is_empty() {
            return Err(Error::InvalidDocument(
                "source_id and external_id must be non-empty".to_string(),
            ));
        }
        if self.source_id.contains('/') {
            return Err(Error::InvalidDocument(format!(
                "source_id '{}' must not contain '/'",
                self.source_id
            )));
        }
        validate_fields(&self.structured_fields)
    }
}

/// SHA-256 over kind, payload and canonical field encoding, hex encoded.
pub fn content_hash(kind: EventKind, payload_text: &str, fields: &Fields) -> String {
    let mut hasher = Sha256::new();
    hasher.update(match kind {
        EventKind::Upsert => b"upsert\0".as_slice(),
        EventKind::Delete => b"delete\0".as_slice(),
    });
    hasher.update(payload_text.as_bytes());
    hasher.update([0u8]);
    // BTreeMap serializes in key order
    let canonical = serde_json::to_vec(fields).unwrap_or_default();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

/// One immutable version of a document inside the index.
///
/// Vector and fields live in the same record, so a reader can never observe
/// the vector of one version paired with the fields of another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedDocument {
    pub doc_id: DocId,
    /// 1-based, strictly increasing per `doc_id`.
    pub version: u64,
    #[serde(skip)]
    pub vector: Arc<[f32]>,
    pub structured_fields: Fields,
    pub tombstoned: bool,
    pub version_applied: LogicalClock,
    pub source_id: String,
    pub external_id: String,
    pub content_hash: String,
    pub payload_text: Arc<str>,
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Scalar)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_doc_id_format() {
        assert_eq!(DocId::new("market", "AAPL").as_str(), "market/AAPL");
    }

    #[test]
    fn test_content_hash_is_stable_and_field_sensitive() {
        let a = fields(&[("price", Scalar::Float(150.0))]);
        let b = fields(&[("price", Scalar::Float(152.3))]);
        let h1 = content_hash(EventKind::Upsert, "AAPL", &a);
        let h2 = content_hash(EventKind::Upsert, "AAPL", &a);
        let h3 = content_hash(EventKind::Upsert, "AAPL", &b);
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_delete_hash_differs_from_empty_upsert() {
        let empty = Fields::new();
        assert_ne!(
            content_hash(EventKind::Upsert, "", &empty),
            content_hash(EventKind::Delete, "", &empty)
        );
    }

    #[test]
    fn test_scalar_numeric_equality() {
        assert!(Scalar::Int(150).matches(&Scalar::Float(150.0)));
        assert!(!Scalar::Str("150".into()).matches(&Scalar::Int(150)));
        assert_eq!(Scalar::Int(150).key(), Scalar::Float(150.0).key());
        assert_eq!(Scalar::Float(-0.0).key(), Scalar::Float(0.0).key());
    }

    #[test]
    fn test_scalar_deserializes_untagged() {
        let parsed: Fields =
            serde_json::from_str(r#"{"a": 1, "b": 2.5, "c": "x", "d": true}"#).unwrap();
        assert_eq!(parsed["a"], Scalar::Int(1));
        assert_eq!(parsed["b"], Scalar::Float(2.5));
        assert_eq!(parsed["c"], Scalar::Str("x".into()));
        assert_eq!(parsed["d"], Scalar::Bool(true));
    }

    #[test]
    fn test_validate_rejects_nan_and_bad_identity() {
        let now = Utc::now();
        let ev = ChangeEvent::upsert(
            "market",
            "AAPL",
            "x",
            fields(&[("price", Scalar::Float(f64::NAN))]),
            now,
            now,
        );
        assert!(matches!(ev.validate(), Err(Error::InvalidDocument(_))));

        let ev = ChangeEvent::upsert("", "AAPL", "x", Fields::new(), now, now);
        assert!(ev.validate().is_err());

        let ev = ChangeEvent::upsert("a/b", "AAPL", "x", Fields::new(), now, now);
        assert!(ev.validate().is_err());
    }
}
