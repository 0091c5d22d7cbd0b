//! Retention.
//!
//! A chunk is dropped once every timestamp its window can hold is at or before
//! `cutoff - window`. Windows are aligned, so no chunk straddles that boundary.

use rusqlite::{Connection, TransactionBehavior};

use crate::backend::{Dialect, RetryPolicy};
use crate::chunk::window_start;
use crate::lookup::LookupTable;
use crate::Result;

/// Chunks whose window starts strictly before this bound are expired.
pub fn expired_window_bound(cutoff_ms: i64, window_ms: i64) -> i64 {
    window_start(
        cutoff_ms.saturating_sub(window_ms).saturating_add(1),
        window_ms,
    )
}

/// Drop every chunk expired by `cutoff_ms`, oldest first.
///
/// Each chunk's table and its lookup rows go in one transaction. Returns the
/// dropped table names; on error, chunks dropped before the failure stay dropped.
pub fn expire_before(
    conn: &mut Connection,
    dialect: &dyn Dialect,
    lookup: &LookupTable,
    retry: &RetryPolicy,
    cutoff_ms: i64,
    window_ms: i64,
) -> Result<Vec<String>> {
    let bound = expired_window_bound(cutoff_ms, window_ms);
    let tables = lookup.tables_before(conn, bound)?;
    let mut dropped = Vec::with_capacity(tables.len());
    for table in tables {
        retry.run(dialect, "expire", || {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", dialect.quote_ident(&table)))?;
            lookup.unregister(&tx, &table)?;
            tx.commit()?;
            Ok(())
        })?;
        log::info!("expired chunk {}", table);
        dropped.push(table);
    }
    Ok(dropped)
}
