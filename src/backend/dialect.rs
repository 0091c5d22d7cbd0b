//! Backend-specific SQL hooks.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, ErrorCode};

use crate::chunk::{ChunkDescriptor, KeyKind, PAYLOAD_COLUMN, TIMESTAMP_COLUMN};
use crate::Result;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The SQL a backend must supply. Everything else the engine emits is plain
/// parameterized SQL with `?` placeholders.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Quote an identifier.
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Statements creating the lookup table and its indexes if missing.
    fn lookup_table_ddl(&self, lookup: &str) -> String;

    /// Statements creating a chunk table and its timestamp index if missing.
    fn chunk_table_ddl(&self, chunk: &ChunkDescriptor) -> String;

    /// Predicate matching `column` against one bound pattern parameter.
    fn pattern_match(&self, column: &str, negated: bool) -> String;

    /// Per-connection setup (pragmas, user functions).
    fn prepare_connection(&self, conn: &Connection) -> Result<()>;

    /// Whether the error means the statement named a table that does not exist.
    fn is_missing_table(&self, err: &rusqlite::Error) -> bool;

    /// Whether the error is a lock or serialization conflict worth retrying.
    fn is_conflict(&self, err: &rusqlite::Error) -> bool;
}

/// SQLite dialect. Pattern matching is regular-expression based through a
/// `regexp()` function registered on every connection.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn lookup_table_ddl(&self, lookup: &str) -> String {
        let table = self.quote_ident(lookup);
        let by_key = self.quote_ident(&format!("{lookup}_by_key"));
        let by_window = self.quote_ident(&format!("{lookup}_by_window"));
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                chunk_table TEXT NOT NULL,
                kind TEXT NOT NULL,
                logical_key TEXT NOT NULL,
                column_name TEXT NOT NULL,
                window_start INTEGER NOT NULL,
                PRIMARY KEY (chunk_table, kind, logical_key)
            );
            CREATE INDEX IF NOT EXISTS {by_key} ON {table} (kind, logical_key, window_start);
            CREATE INDEX IF NOT EXISTS {by_window} ON {table} (window_start);"
        )
    }

    fn chunk_table_ddl(&self, chunk: &ChunkDescriptor) -> String {
        let table = self.quote_ident(&chunk.table);
        let index = self.quote_ident(&format!("{}_{}", chunk.table, TIMESTAMP_COLUMN));
        let mut columns = vec![
            format!("{} INTEGER NOT NULL", self.quote_ident(TIMESTAMP_COLUMN)),
            format!("{} BLOB", self.quote_ident(PAYLOAD_COLUMN)),
        ];
        for spec in chunk.value_columns() {
            let ty = match spec.kind {
                KeyKind::Metadata => "TEXT",
                _ => "REAL",
            };
            columns.push(format!("{} {} NOT NULL", self.quote_ident(&spec.column), ty));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {table} ({});
            CREATE INDEX IF NOT EXISTS {index} ON {table} ({});",
            columns.join(", "),
            self.quote_ident(TIMESTAMP_COLUMN)
        )
    }

    fn pattern_match(&self, column: &str, negated: bool) -> String {
        if negated {
            format!("{} NOT REGEXP ?", self.quote_ident(column))
        } else {
            format!("{} REGEXP ?", self.quote_ident(column))
        }
    }

    fn prepare_connection(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        // `x REGEXP y` is evaluated as `regexp(y, x)`.
        conn.create_scalar_function(
            "regexp",
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let pattern: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> std::result::Result<_, BoxError> {
                    Ok(Regex::new(vr.as_str()?)?)
                })?;
                let text = ctx
                    .get_raw(1)
                    .as_str()
                    .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                Ok(pattern.is_match(text))
            },
        )?;
        Ok(())
    }

    fn is_missing_table(&self, err: &rusqlite::Error) -> bool {
        match err {
            rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.starts_with("no such table"),
            _ => false,
        }
    }

    fn is_conflict(&self, err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
        )
    }
}
