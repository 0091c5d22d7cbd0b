//! Lookup table access.
//!
//! The lookup table is the authoritative record of which chunk tables exist, which
//! window each covers, and which physical column stores each logical key. Chunk
//! discovery, reverse column mapping and expiry all read it; only chunk creation
//! and expiry write it.

use std::collections::BTreeMap;

use rusqlite::{params, params_from_iter, Connection};

use crate::backend::Dialect;
use crate::chunk::{ChunkDescriptor, ColumnSpec, KeyKind};
use crate::{Error, Result};

/// Tables described per statement, well below SQLite's bound-parameter limit.
const DESCRIBE_BATCH: usize = 500;

/// One lookup row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRow {
    pub chunk_table: String,
    pub kind: KeyKind,
    pub logical_key: String,
    pub column_name: String,
    pub window_start: i64,
}

#[derive(Debug, Clone)]
pub struct LookupTable {
    name: String,
    quoted: String,
}

impl LookupTable {
    pub fn new(name: impl Into<String>, dialect: &dyn Dialect) -> Self {
        let name = name.into();
        let quoted = dialect.quote_ident(&name);
        Self { name, quoted }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quoted identifier for use in SQL text.
    pub fn quoted(&self) -> &str {
        &self.quoted
    }

    pub fn ensure(&self, conn: &Connection, dialect: &dyn Dialect) -> Result<()> {
        conn.execute_batch(&dialect.lookup_table_ddl(&self.name))?;
        Ok(())
    }

    /// Record every column of a chunk. Rows already present are left untouched, so
    /// concurrent creators of the same chunk converge on one row per key.
    pub fn register(&self, conn: &Connection, chunk: &ChunkDescriptor) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (chunk_table, kind, logical_key, column_name, window_start)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (chunk_table, kind, logical_key) DO NOTHING",
            self.quoted
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        for spec in &chunk.columns {
            stmt.execute(params![
                chunk.table,
                spec.kind.code(),
                spec.key,
                spec.column,
                chunk.window_start
            ])?;
        }
        Ok(())
    }

    /// Delete every row of a chunk.
    pub fn unregister(&self, conn: &Connection, table: &str) -> Result<usize> {
        let sql = format!("DELETE FROM {} WHERE chunk_table = ?1", self.quoted);
        Ok(conn.execute(&sql, params![table])?)
    }

    pub fn rows(&self, conn: &Connection) -> Result<Vec<LookupRow>> {
        let sql = format!(
            "SELECT chunk_table, kind, logical_key, column_name, window_start FROM {}
             ORDER BY chunk_table, kind, logical_key",
            self.quoted
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Every chunk in the namespace.
    pub fn chunks(&self, conn: &Connection) -> Result<Vec<ChunkDescriptor>> {
        Ok(group_rows(self.rows(conn)?))
    }

    /// Descriptors for the named chunk tables, in table-name order. Tables without
    /// lookup rows are skipped.
    pub fn describe(&self, conn: &Connection, tables: &[String]) -> Result<Vec<ChunkDescriptor>> {
        let mut rows = Vec::new();
        for batch in tables.chunks(DESCRIBE_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT chunk_table, kind, logical_key, column_name, window_start FROM {}
                 WHERE chunk_table IN ({})",
                self.quoted, placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            for row in stmt.query_map(params_from_iter(batch.iter()), map_row)? {
                rows.push(row??);
            }
        }
        Ok(group_rows(rows))
    }

    /// Chunk tables whose window starts before `bound`, oldest first.
    pub fn tables_before(&self, conn: &Connection, bound: i64) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT chunk_table, MIN(window_start) AS w FROM {} WHERE window_start < ?1
             GROUP BY chunk_table ORDER BY w, chunk_table",
            self.quoted
        );
        let mut stmt = conn.prepare(&sql)?;
        let tables = stmt
            .query_map(params![bound], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tables)
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<LookupRow>> {
    let kind: String = row.get(1)?;
    let Some(kind) = KeyKind::from_code(&kind) else {
        return Ok(Err(Error::Backend(rusqlite::Error::InvalidColumnType(
            1,
            format!("kind '{}'", kind),
            rusqlite::types::Type::Text,
        ))));
    };
    Ok(Ok(LookupRow {
        chunk_table: row.get(0)?,
        kind,
        logical_key: row.get(2)?,
        column_name: row.get(3)?,
        window_start: row.get(4)?,
    }))
}

fn group_rows(rows: Vec<LookupRow>) -> Vec<ChunkDescriptor> {
    let mut grouped: BTreeMap<String, (i64, Vec<ColumnSpec>)> = BTreeMap::new();
    for row in rows {
        let entry = grouped
            .entry(row.chunk_table)
            .or_insert_with(|| (row.window_start, Vec::new()));
        entry.1.push(ColumnSpec {
            kind: row.kind,
            key: row.logical_key,
            column: row.column_name,
        });
    }
    grouped
        .into_iter()
        .map(|(table, (window_start, columns))| {
            ChunkDescriptor::from_columns(table, window_start, columns)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteDialect;
    use crate::chunk::ChunkId;
    use crate::config::DAY_MS;
    use crate::event::Event;

    fn setup() -> (Connection, LookupTable) {
        let conn = Connection::open_in_memory().unwrap();
        let lookup = LookupTable::new("_strata_lookup", &SqliteDialect);
        lookup.ensure(&conn, &SqliteDialect).unwrap();
        (conn, lookup)
    }

    fn descriptor(event: &Event) -> ChunkDescriptor {
        ChunkDescriptor::for_chunk(&ChunkId::of(event, DAY_MS), "ev_", DAY_MS)
    }

    #[test]
    fn test_register_is_idempotent() {
        let (conn, lookup) = setup();
        let desc = descriptor(&Event::new(0).with_metadata("host", "a").with_dimension("cpu", 1.0));

        lookup.register(&conn, &desc).unwrap();
        lookup.register(&conn, &desc).unwrap();

        let rows = lookup.rows(&conn).unwrap();
        // ts + host + cpu
        assert_eq!(rows.len(), 3);
        assert_eq!(lookup.chunks(&conn).unwrap(), vec![desc]);
    }

    #[test]
    fn test_keyless_chunk_is_discoverable() {
        let (conn, lookup) = setup();
        let desc = descriptor(&Event::new(0));
        lookup.register(&conn, &desc).unwrap();

        let chunks = lookup.chunks(&conn).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].table, desc.table);
    }

    #[test]
    fn test_describe_and_tables_before() {
        let (conn, lookup) = setup();
        let day0 = descriptor(&Event::new(0).with_metadata("host", "a"));
        let day1 = descriptor(&Event::new(DAY_MS).with_metadata("host", "a"));
        lookup.register(&conn, &day0).unwrap();
        lookup.register(&conn, &day1).unwrap();

        let described = lookup
            .describe(&conn, &[day1.table.clone(), "ev_missing".to_string()])
            .unwrap();
        assert_eq!(described, vec![day1.clone()]);

        assert_eq!(lookup.tables_before(&conn, DAY_MS).unwrap(), vec![day0.table.clone()]);
        assert_eq!(lookup.tables_before(&conn, 2 * DAY_MS).unwrap().len(), 2);

        assert_eq!(lookup.unregister(&conn, &day0.table).unwrap(), 2);
        assert_eq!(lookup.tables_before(&conn, 2 * DAY_MS).unwrap(), vec![day1.table]);
    }
}
