//! Predicate language and its SQL translation.
//!
//! Metadata values (string columns):
//!
//! | value      | meaning              |
//! |------------|----------------------|
//! | `v`, `=v`  | equal                |
//! | `!=v`      | not equal            |
//! | `~re`      | pattern match        |
//! | `!~re`     | negated pattern match|
//!
//! Dimension values (numeric columns): `v`, `=v`, `!=v`, `a..b` (inclusive),
//! `>v`, `>=v`, `<v`, `<=v`.
//!
//! Every predicate becomes one parameterized fragment; values are always bound.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::types::Value;

use crate::backend::Dialect;
use crate::chunk::{ChunkDescriptor, KeyKind};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataOp {
    Eq,
    Ne,
    Match,
    NotMatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataPredicate {
    pub key: String,
    pub op: MetadataOp,
    pub value: String,
}

impl MetadataPredicate {
    pub fn parse(key: &str, raw: &str) -> Self {
        let (op, value) = if let Some(v) = raw.strip_prefix("!=") {
            (MetadataOp::Ne, v)
        } else if let Some(v) = raw.strip_prefix("!~") {
            (MetadataOp::NotMatch, v)
        } else if let Some(v) = raw.strip_prefix('~') {
            (MetadataOp::Match, v)
        } else if let Some(v) = raw.strip_prefix('=') {
            (MetadataOp::Eq, v)
        } else {
            (MetadataOp::Eq, raw)
        };
        Self {
            key: key.to_string(),
            op,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DimensionOp {
    Eq(f64),
    Ne(f64),
    Between(f64, f64),
    Gt(f64),
    Ge(f64),
    Lt(f64),
    Le(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionPredicate {
    pub key: String,
    pub op: DimensionOp,
}

impl DimensionPredicate {
    pub fn parse(key: &str, raw: &str) -> Result<Self> {
        let num = |s: &str| -> Result<f64> {
            let trimmed = s.trim();
            match trimmed.parse::<f64>() {
                Ok(v) if !v.is_nan() => Ok(v),
                _ => Err(Error::InvalidQuery(format!(
                    "dimension '{}': '{}' is not a number",
                    key, s
                ))),
            }
        };
        let raw = raw.trim();
        let op = if let Some(v) = raw.strip_prefix(">=") {
            DimensionOp::Ge(num(v)?)
        } else if let Some(v) = raw.strip_prefix("<=") {
            DimensionOp::Le(num(v)?)
        } else if let Some(v) = raw.strip_prefix("!=") {
            DimensionOp::Ne(num(v)?)
        } else if let Some(v) = raw.strip_prefix('>') {
            DimensionOp::Gt(num(v)?)
        } else if let Some(v) = raw.strip_prefix('<') {
            DimensionOp::Lt(num(v)?)
        } else if let Some(v) = raw.strip_prefix('=') {
            DimensionOp::Eq(num(v)?)
        } else if let Some((lo, hi)) = raw.split_once("..") {
            DimensionOp::Between(num(lo)?, num(hi)?)
        } else {
            DimensionOp::Eq(num(raw)?)
        };
        Ok(Self {
            key: key.to_string(),
            op,
        })
    }
}

/// A parameterized SQL fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlFragment {
    pub fn always_true() -> Self {
        Self {
            sql: "1 = 1".to_string(),
            params: Vec::new(),
        }
    }
}

/// Parsed metadata and dimension predicates, combined with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    metadata: Vec<MetadataPredicate>,
    dimensions: Vec<DimensionPredicate>,
}

impl Filter {
    pub fn parse(
        metadata: &BTreeMap<String, String>,
        dimensions: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let metadata = metadata
            .iter()
            .map(|(k, v)| MetadataPredicate::parse(k, v))
            .collect();
        let dimensions = dimensions
            .iter()
            .map(|(k, v)| DimensionPredicate::parse(k, v))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            metadata,
            dimensions,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.dimensions.is_empty()
    }

    pub fn metadata_keys(&self) -> BTreeSet<String> {
        self.metadata.iter().map(|p| p.key.clone()).collect()
    }

    pub fn dimension_keys(&self) -> BTreeSet<String> {
        self.dimensions.iter().map(|p| p.key.clone()).collect()
    }

    /// Translate against one chunk's columns.
    ///
    /// The chunk must carry every key the filter names; the planner only hands out
    /// chunks that do.
    pub fn to_sql(&self, chunk: &ChunkDescriptor, dialect: &dyn Dialect) -> Result<SqlFragment> {
        if self.is_empty() {
            return Ok(SqlFragment::always_true());
        }
        let mut parts = Vec::with_capacity(self.metadata.len() + self.dimensions.len());
        let mut params = Vec::new();
        for p in &self.metadata {
            let raw = column(chunk, KeyKind::Metadata, &p.key)?;
            let col = dialect.quote_ident(raw);
            parts.push(match p.op {
                MetadataOp::Eq => format!("{col} = ?"),
                MetadataOp::Ne => format!("{col} != ?"),
                MetadataOp::Match => dialect.pattern_match(raw, false),
                MetadataOp::NotMatch => dialect.pattern_match(raw, true),
            });
            params.push(Value::Text(p.value.clone()));
        }
        for p in &self.dimensions {
            let col = dialect.quote_ident(column(chunk, KeyKind::Dimension, &p.key)?);
            match p.op {
                DimensionOp::Eq(v) => {
                    parts.push(format!("{col} = ?"));
                    params.push(Value::Real(v));
                }
                DimensionOp::Ne(v) => {
                    parts.push(format!("{col} != ?"));
                    params.push(Value::Real(v));
                }
                DimensionOp::Between(lo, hi) => {
                    parts.push(format!("{col} BETWEEN ? AND ?"));
                    params.push(Value::Real(lo));
                    params.push(Value::Real(hi));
                }
                DimensionOp::Gt(v) => {
                    parts.push(format!("{col} > ?"));
                    params.push(Value::Real(v));
                }
                DimensionOp::Ge(v) => {
                    parts.push(format!("{col} >= ?"));
                    params.push(Value::Real(v));
                }
                DimensionOp::Lt(v) => {
                    parts.push(format!("{col} < ?"));
                    params.push(Value::Real(v));
                }
                DimensionOp::Le(v) => {
                    parts.push(format!("{col} <= ?"));
                    params.push(Value::Real(v));
                }
            }
        }
        Ok(SqlFragment {
            sql: parts.join(" AND "),
            params,
        })
    }
}

fn column<'c>(chunk: &'c ChunkDescriptor, kind: KeyKind, key: &str) -> Result<&'c str> {
    chunk.column_for(kind, key).ok_or_else(|| {
        Error::InvalidQuery(format!("chunk {} has no key '{}'", chunk.table, key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteDialect;
    use crate::chunk::ChunkId;
    use crate::config::DAY_MS;
    use crate::event::Event;

    fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn chunk() -> ChunkDescriptor {
        let event = Event::new(0)
            .with_metadata("host", "a")
            .with_dimension("cpu", 1.0)
            .with_dimension("mem", 1.0);
        ChunkDescriptor::for_chunk(&ChunkId::of(&event, DAY_MS), "ev_", DAY_MS)
    }

    #[test]
    fn test_metadata_grammar() {
        assert_eq!(MetadataPredicate::parse("k", "web").op, MetadataOp::Eq);
        assert_eq!(MetadataPredicate::parse("k", "=web").value, "web");
        assert_eq!(MetadataPredicate::parse("k", "!=web").op, MetadataOp::Ne);
        assert_eq!(MetadataPredicate::parse("k", "~^w").op, MetadataOp::Match);
        let p = MetadataPredicate::parse("k", "!~^w");
        assert_eq!(p.op, MetadataOp::NotMatch);
        assert_eq!(p.value, "^w");
    }

    #[test]
    fn test_dimension_grammar() {
        let op = |raw| DimensionPredicate::parse("cpu", raw).unwrap().op;
        assert_eq!(op("5"), DimensionOp::Eq(5.0));
        assert_eq!(op("=5"), DimensionOp::Eq(5.0));
        assert_eq!(op("!=5"), DimensionOp::Ne(5.0));
        assert_eq!(op("20..29"), DimensionOp::Between(20.0, 29.0));
        assert_eq!(op("-1.5..2.5"), DimensionOp::Between(-1.5, 2.5));
        assert_eq!(op(">5"), DimensionOp::Gt(5.0));
        assert_eq!(op(">=25"), DimensionOp::Ge(25.0));
        assert_eq!(op("<5"), DimensionOp::Lt(5.0));
        assert_eq!(op("<=5"), DimensionOp::Le(5.0));
        assert_eq!(op("-3"), DimensionOp::Eq(-3.0));
    }

    #[test]
    fn test_dimension_grammar_errors() {
        assert!(DimensionPredicate::parse("cpu", "abc").is_err());
        assert!(DimensionPredicate::parse("cpu", ">=").is_err());
        assert!(DimensionPredicate::parse("cpu", "1..").is_err());
        assert!(DimensionPredicate::parse("cpu", "NaN").is_err());
    }

    #[test]
    fn test_empty_filter_is_always_true() {
        let filter = Filter::default();
        assert_eq!(
            filter.to_sql(&chunk(), &SqliteDialect).unwrap(),
            SqlFragment::always_true()
        );
    }

    #[test]
    fn test_translation_binds_values() {
        let filter = Filter::parse(
            &query(&[("host", "~^web'; DROP TABLE x")]),
            &query(&[("cpu", "20..29"), ("mem", ">=1")]),
        )
        .unwrap();
        let desc = chunk();
        let frag = filter.to_sql(&desc, &SqliteDialect).unwrap();

        let host = desc.column_for(KeyKind::Metadata, "host").unwrap();
        let cpu = desc.column_for(KeyKind::Dimension, "cpu").unwrap();
        assert_eq!(
            frag.sql,
            format!(
                "\"{host}\" REGEXP ? AND \"{cpu}\" BETWEEN ? AND ? AND \"{}\" >= ?",
                desc.column_for(KeyKind::Dimension, "mem").unwrap()
            )
        );
        assert_eq!(frag.params.len(), 4);
        assert_eq!(frag.params[0], Value::Text("^web'; DROP TABLE x".to_string()));
        assert!(!frag.sql.contains("DROP"));
    }

    #[test]
    fn test_translation_requires_key() {
        let filter = Filter::parse(&query(&[("region", "eu")]), &BTreeMap::new()).unwrap();
        assert!(matches!(
            filter.to_sql(&chunk(), &SqliteDialect),
            Err(Error::InvalidQuery(_))
        ));
    }
}
