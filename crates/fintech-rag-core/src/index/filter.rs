//! Metadata filters and the field postings that accelerate them.
//!
//! A [`Filter`] is a conjunction of [`FieldClause`]s plus an optional set of
//! source ids. Equality and set-membership clauses are *indexable*: the
//! [`FieldPostings`] map `(field, value) → doc_ids` yields a candidate
//! superset which is then verified against the snapshot-visible version of
//! each document. Range and inequality clauses are always evaluated exactly
//! on that version.
//!
//! Postings are append-mostly. A document is added to a posting list before
//! the version carrying that value becomes readable, and is only removed by
//! compaction once no retained version carries the value any more.
//!
//! | Clause | CLI form | Indexable |
//! |--------|----------|-----------|
//! | `Eq` | `field=value` | yes |
//! | `In` | `field=a|b|c` | yes |
//! | `Ne` | `field!=value` | no |
//! | `Range` | `field>=x`, `field<x`, … | no |

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{DocId, Fields, IndexedDocument, Scalar, ScalarKey};

/// One predicate over a structured field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldClause {
    Eq {
        field: String,
        value: Scalar,
    },
    In {
        field: String,
        values: Vec<Scalar>,
    },
    Ne {
        field: String,
        value: Scalar,
    },
    Range {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gt: Option<Scalar>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<Scalar>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lt: Option<Scalar>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lte: Option<Scalar>,
    },
}

impl FieldClause {
    pub fn field(&self) -> &str {
        match self {
            FieldClause::Eq { field, .. }
            | FieldClause::In { field, .. }
            | FieldClause::Ne { field, .. }
            | FieldClause::Range { field, .. } => field,
        }
    }

    /// Parse the CLI form: `field=value`, `field=a|b`, `field!=value`,
    /// `field>value`, `field>=value`, `field<value`, `field<=value`.
    pub fn parse(expr: &str) -> Result<FieldClause> {
        // leftmost operator wins; on a tie `>=` beats `>`
        const OPS: [&str; 6] = ["!=", ">=", "<=", "=", ">", "<"];
        let (pos, op) = OPS
            .iter()
            .filter_map(|op| expr.find(op).map(|pos| (pos, *op)))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())))
            .ok_or_else(|| {
                Error::InvalidQuery(format!("filter '{}' has no operator", expr))
            })?;

        let field = expr[..pos].trim().to_string();
        let raw = expr[pos + op.len()..].trim();
        if field.is_empty() {
            return Err(Error::InvalidQuery(format!(
                "filter '{}' has an empty field name",
                expr
            )));
        }
        if raw.is_empty() {
            return Err(Error::InvalidQuery(format!(
                "filter '{}' has an empty value",
                expr
            )));
        }

        let clause = match op {
            "=" if raw.contains('|') => FieldClause::In {
                field,
                values: raw.split('|').map(|v| parse_scalar(v.trim())).collect(),
            },
            "=" => FieldClause::Eq {
                field,
                value: parse_scalar(raw),
            },
            "!=" => FieldClause::Ne {
                field,
                value: parse_scalar(raw),
            },
            _ => {
                let v = Some(parse_scalar(raw));
                let (gt, gte, lt, lte) = match op {
                    ">" => (v, None, None, None),
                    ">=" => (None, v, None, None),
                    "<" => (None, None, v, None),
                    _ => (None, None, None, v),
                };
                FieldClause::Range {
                    field,
                    gt,
                    gte,
                    lt,
                    lte,
                }
            }
        };
        clause.validate()?;
        Ok(clause)
    }

    pub fn validate(&self) -> Result<()> {
        if self.field().trim().is_empty() {
            return Err(Error::InvalidQuery("filter field name is empty".into()));
        }
        let check = |v: &Scalar| -> Result<()> {
            match v {
                Scalar::Float(f) if !f.is_finite() => Err(Error::InvalidQuery(format!(
                    "filter on '{}' uses a non-finite number",
                    self.field()
                ))),
                _ => Ok(()),
            }
        };
        match self {
            FieldClause::Eq { value, .. } | FieldClause::Ne { value, .. } => check(value),
            FieldClause::In { values, .. } => {
                if values.is_empty() {
                    return Err(Error::InvalidQuery(format!(
                        "'in' filter on '{}' has no values",
                        self.field()
                    )));
                }
                values.iter().try_for_each(check)
            }
            FieldClause::Range {
                gt, gte, lt, lte, ..
            } => {
                let bounds: Vec<&Scalar> = [gt, gte, lt, lte].into_iter().flatten().collect();
                if bounds.is_empty() {
                    return Err(Error::InvalidQuery(format!(
                        "range filter on '{}' has no bounds",
                        self.field()
                    )));
                }
                for b in bounds {
                    check(b)?;
                    if matches!(b, Scalar::Bool(_)) {
                        return Err(Error::InvalidQuery(format!(
                            "range filter on '{}' cannot compare booleans",
                            self.field()
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Exact evaluation against one document's fields.
    pub fn matches(&self, fields: &Fields) -> bool {
        let stored = fields.get(self.field());
        match self {
            FieldClause::Eq { value, .. } => stored.is_some_and(|s| s.matches(value)),
            FieldClause::In { values, .. } => {
                stored.is_some_and(|s| values.iter().any(|v| s.matches(v)))
            }
            FieldClause::Ne { value, .. } => !stored.is_some_and(|s| s.matches(value)),
            FieldClause::Range {
                gt, gte, lt, lte, ..
            } => {
                let Some(s) = stored else {
                    return false;
                };
                let ok = |bound: &Option<Scalar>, accept: &dyn Fn(Ordering) -> bool| match bound {
                    None => true,
                    Some(b) => compare(s, b).is_some_and(accept),
                };
                ok(gt, &|o: Ordering| o == Ordering::Greater)
                    && ok(gte, &|o: Ordering| o != Ordering::Less)
                    && ok(lt, &|o: Ordering| o == Ordering::Less)
                    && ok(lte, &|o: Ordering| o != Ordering::Greater)
            }
        }
    }

    fn posting_keys(&self) -> Option<Vec<ScalarKey>> {
        match self {
            FieldClause::Eq { value, .. } => Some(vec![value.key()]),
            FieldClause::In { values, .. } => Some(values.iter().map(Scalar::key).collect()),
            _ => None,
        }
    }
}

/// Numbers compare numerically, strings lexicographically; anything else
/// is incomparable.
fn compare(a: &Scalar, b: &Scalar) -> Option<Ordering> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

/// `true`/`false`, then integers, then floats, otherwise a string.
fn parse_scalar(raw: &str) -> Scalar {
    match raw {
        "true" => return Scalar::Bool(true),
        "false" => return Scalar::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Scalar::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Scalar::Float(f);
        }
    }
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(raw);
    Scalar::Str(unquoted.to_string())
}

/// A conjunction of clauses, optionally restricted to some sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Empty means every source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clauses: Vec<FieldClause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.sources.push(source_id.into());
        self
    }

    pub fn clause(mut self, clause: FieldClause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Shorthand for an equality clause.
    pub fn eq(self, field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.clause(FieldClause::Eq {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.clauses.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::InvalidQuery("empty source id in filter".into()));
        }
        self.clauses.iter().try_for_each(FieldClause::validate)
    }

    /// Exact evaluation against one version.
    pub fn matches(&self, doc: &IndexedDocument) -> bool {
        (self.sources.is_empty() || self.sources.iter().any(|s| *s == doc.source_id))
            && self.clauses.iter().all(|c| c.matches(&doc.structured_fields))
    }
}

/// Inverted index `(field, value) → doc_ids`.
#[derive(Debug, Default)]
pub struct FieldPostings {
    lists: RwLock<HashMap<String, HashMap<ScalarKey, HashSet<DocId>>>>,
}

impl FieldPostings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc_id: &DocId, fields: &Fields) {
        if fields.is_empty() {
            return;
        }
        let mut lists = self.lists.write();
        for (name, value) in fields {
            lists
                .entry(name.clone())
                .or_default()
                .entry(value.key())
                .or_default()
                .insert(doc_id.clone());
        }
    }

    /// Drop `doc_id` from every posting of `removed` that is not also
    /// carried by a retained version.
    pub fn remove_stale(&self, doc_id: &DocId, removed: &[&Fields], retained: &[&Fields]) {
        let keep: HashSet<(&str, ScalarKey)> = retained
            .iter()
            .flat_map(|f| f.iter().map(|(k, v)| (k.as_str(), v.key())))
            .collect();
        let mut lists = self.lists.write();
        for fields in removed {
            for (name, value) in fields.iter() {
                let key = value.key();
                if keep.contains(&(name.as_str(), key.clone())) {
                    continue;
                }
                if let Some(by_value) = lists.get_mut(name) {
                    if let Some(ids) = by_value.get_mut(&key) {
                        ids.remove(doc_id);
                        if ids.is_empty() {
                            by_value.remove(&key);
                        }
                    }
                    if by_value.is_empty() {
                        lists.remove(name);
                    }
                }
            }
        }
    }

    /// Candidate superset for `filter`, or `None` when no clause is
    /// indexable and a full scan is required.
    pub fn candidates(&self, filter: &Filter) -> Option<HashSet<DocId>> {
        let lists = self.lists.read();
        let mut acc: Option<HashSet<DocId>> = None;
        for clause in &filter.clauses {
            let Some(keys) = clause.posting_keys() else {
                continue;
            };
            let by_value = lists.get(clause.field());
            let mut union: HashSet<DocId> = HashSet::new();
            for key in keys {
                if let Some(ids) = by_value.and_then(|m| m.get(&key)) {
                    union.extend(ids.iter().cloned());
                }
            }
            acc = Some(match acc {
                None => union,
                Some(prev) => prev.intersection(&union).cloned().collect(),
            });
            if acc.as_ref().is_some_and(HashSet::is_empty) {
                break;
            }
        }
        acc
    }

    /// Number of `(field, value)` posting lists.
    pub fn list_count(&self) -> usize {
        self.lists.read().values().map(HashMap::len).sum()
    }
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
    fn test_parse_operators() {
        assert_eq!(
            FieldClause::parse("symbol=AAPL").unwrap(),
            FieldClause::Eq {
                field: "symbol".into(),
                value: Scalar::Str("AAPL".into())
            }
        );
        assert!(matches!(
            FieldClause::parse("price>=150").unwrap(),
            FieldClause::Range { gte: Some(Scalar::Int(150)), .. }
        ));
        assert!(matches!(
            FieldClause::parse("price<152.5").unwrap(),
            FieldClause::Range { lt: Some(Scalar::Float(_)), .. }
        ));
        assert!(matches!(
            FieldClause::parse("list!=OFAC").unwrap(),
            FieldClause::Ne { .. }
        ));
        assert!(matches!(
            FieldClause::parse("list=OFAC|EU").unwrap(),
            FieldClause::In { ref values, .. } if values.len() == 2
        ));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            FieldClause::parse("symbol"),
            Err(Error::InvalidQuery(_))
        ));
        assert!(FieldClause::parse("=AAPL").is_err());
        assert!(FieldClause::parse("symbol=").is_err());
        assert!(FieldClause::parse("flag>true").is_err());
    }

    #[test]
    fn test_range_and_ne_match_exactly() {
        let f = fields(&[("price", Scalar::Float(152.3)), ("list", "OFAC".into())]);
        assert!(FieldClause::parse("price>150").unwrap().matches(&f));
        assert!(!FieldClause::parse("price<=150").unwrap().matches(&f));
        assert!(FieldClause::parse("list!=EU").unwrap().matches(&f));
        assert!(!FieldClause::parse("list!=OFAC").unwrap().matches(&f));
        // missing field never satisfies a range
        assert!(!FieldClause::parse("volume>0").unwrap().matches(&f));
    }

    #[test]
    fn test_postings_candidates_intersect() {
        let p = FieldPostings::new();
        let a = DocId::new("market", "AAPL");
        let m = DocId::new("market", "MSFT");
        p.insert(&a, &fields(&[("symbol", "AAPL".into()), ("exchange", "NASDAQ".into())]));
        p.insert(&m, &fields(&[("symbol", "MSFT".into()), ("exchange", "NASDAQ".into())]));

        let filter = Filter::new().eq("exchange", "NASDAQ").eq("symbol", "AAPL");
        let c = p.candidates(&filter).unwrap();
        assert_eq!(c.len(), 1);
        assert!(c.contains(&a));

        let range_only = Filter::new().clause(FieldClause::parse("price>1").unwrap());
        assert!(p.candidates(&range_only).is_none());
    }

    #[test]
    fn test_remove_stale_keeps_retained_values() {
        let p = FieldPostings::new();
        let a = DocId::new("market", "AAPL");
        let old = fields(&[("price", Scalar::Float(150.0)), ("symbol", "AAPL".into())]);
        let new = fields(&[("price", Scalar::Float(152.3)), ("symbol", "AAPL".into())]);
        p.insert(&a, &old);
        p.insert(&a, &new);
        p.remove_stale(&a, &[&old], &[&new]);

        assert!(p
            .candidates(&Filter::new().eq("price", 150.0))
            .unwrap()
            .is_empty());
        assert!(p
            .candidates(&Filter::new().eq("symbol", "AAPL"))
            .unwrap()
            .contains(&a));
    }
}
