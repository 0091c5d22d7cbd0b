//! Chunk discovery.
//!
//! Candidate chunks come from the lookup table alone: a chunk qualifies when its
//! window lies in the (slack-expanded) time range and it carries every key the
//! query needs. SQL filtering happens afterwards, per chunk.

use std::collections::BTreeSet;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::chunk::{ChunkDescriptor, KeyKind};
use crate::lookup::LookupTable;
use crate::query::Filter;
use crate::Result;

/// Time range and required keys of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkQuery {
    pub start_ms: i64,
    pub end_ms: i64,
    pub metadata_keys: BTreeSet<String>,
    pub dimension_keys: BTreeSet<String>,
}

impl ChunkQuery {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self {
            start_ms,
            end_ms,
            ..Self::default()
        }
    }

    /// Range plus every key named by the filter.
    pub fn for_filter(start_ms: i64, end_ms: i64, filter: &Filter) -> Self {
        Self {
            start_ms,
            end_ms,
            metadata_keys: filter.metadata_keys(),
            dimension_keys: filter.dimension_keys(),
        }
    }

    pub fn require_metadata(mut self, key: impl Into<String>) -> Self {
        self.metadata_keys.insert(key.into());
        self
    }

    pub fn require_dimension(mut self, key: impl Into<String>) -> Self {
        self.dimension_keys.insert(key.into());
        self
    }

    /// Window-start bounds including one window of slack on each side.
    pub fn window_bounds(&self, window_ms: i64) -> (i64, i64) {
        (
            self.start_ms.saturating_sub(window_ms),
            self.end_ms.saturating_add(window_ms),
        )
    }

    /// Candidate query: one existence subquery per required key, intersected.
    pub fn to_sql(&self, lookup: &LookupTable, window_ms: i64) -> (String, Vec<Value>) {
        let (lo, hi) = self.window_bounds(window_ms);
        let table = lookup.quoted();
        let mut selects = Vec::with_capacity(1 + self.metadata_keys.len() + self.dimension_keys.len());
        let mut params = Vec::new();

        selects.push(format!(
            "SELECT chunk_table FROM {table} WHERE kind = ? AND window_start BETWEEN ? AND ?"
        ));
        params.extend([
            Value::Text(KeyKind::Timestamp.code().to_string()),
            Value::Integer(lo),
            Value::Integer(hi),
        ]);

        let required = self
            .metadata_keys
            .iter()
            .map(|k| (KeyKind::Metadata, k))
            .chain(self.dimension_keys.iter().map(|k| (KeyKind::Dimension, k)));
        for (kind, key) in required {
            selects.push(format!(
                "SELECT chunk_table FROM {table} WHERE kind = ? AND logical_key = ? AND window_start BETWEEN ? AND ?"
            ));
            params.extend([
                Value::Text(kind.code().to_string()),
                Value::Text(key.clone()),
                Value::Integer(lo),
                Value::Integer(hi),
            ]);
        }

        (format!("{} ORDER BY 1", selects.join(" INTERSECT ")), params)
    }
}

/// Chunks that can hold rows for the query, in table-name order.
pub fn find_chunks(
    conn: &Connection,
    lookup: &LookupTable,
    window_ms: i64,
    query: &ChunkQuery,
) -> Result<Vec<ChunkDescriptor>> {
    if query.start_ms > query.end_ms {
        return Ok(Vec::new());
    }
    let (sql, params) = query.to_sql(lookup, window_ms);
    let mut stmt = conn.prepare(&sql)?;
    let tables = stmt
        .query_map(params_from_iter(params), |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    log::debug!(
        "planned {} chunks for [{}, {}] metadata={:?} dimensions={:?}",
        tables.len(),
        query.start_ms,
        query.end_ms,
        query.metadata_keys,
        query.dimension_keys
    );
    if tables.is_empty() {
        return Ok(Vec::new());
    }
    lookup.describe(conn, &tables)
}
