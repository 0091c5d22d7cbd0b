//! Write path.
//!
//! A batch is split by chunk identity and each group is inserted with one prepared
//! statement. All groups share one transaction: either the whole batch becomes
//! visible or none of it does.

use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};

use crate::backend::{Dialect, RetryPolicy};
use crate::chunk::{partition_events, ChunkDescriptor, ChunkId, KeyKind, PAYLOAD_COLUMN};
use crate::event::{Event, Namespace};
use crate::lookup::LookupTable;
use crate::schema::SchemaRegistry;
use crate::{Error, Result};

/// Everything the write path needs besides the connection.
pub struct WriteContext<'a> {
    pub dialect: &'a dyn Dialect,
    pub lookup: &'a LookupTable,
    pub schema: &'a SchemaRegistry,
    pub retry: RetryPolicy,
}

/// Store a batch of events. Returns the number of rows inserted.
pub fn write_batch(
    ctx: &WriteContext<'_>,
    conn: &mut Connection,
    namespace: &Namespace,
    events: &[Event],
) -> Result<usize> {
    if events.is_empty() {
        return Ok(0);
    }
    for event in events {
        event.validate()?;
    }
    let groups = partition_events(events, ctx.schema.window_ms());
    log::debug!(
        "store {}: {} events across {} chunks",
        namespace,
        events.len(),
        groups.len()
    );

    let (inserted, created) = ctx.retry.run(ctx.dialect, "store", || {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut inserted = 0;
        let mut resolved = Vec::with_capacity(groups.len());
        for (id, group) in &groups {
            let (desc, known) = ctx.schema.resolve(namespace, id);
            inserted += insert_with_create(ctx, &tx, &desc, group)?;
            if !known {
                resolved.push((id.clone(), desc));
            }
        }
        tx.commit()?;
        Ok::<_, Error>((inserted, resolved))
    })?;

    ctx.schema.remember(namespace, created);
    Ok(inserted)
}

/// Insert a group; if its table is missing, create it and retry exactly once.
fn insert_with_create(
    ctx: &WriteContext<'_>,
    conn: &Connection,
    chunk: &ChunkDescriptor,
    events: &[&Event],
) -> Result<usize> {
    match insert_group(ctx.dialect, conn, chunk, events) {
        Ok(n) => Ok(n),
        Err(err)
            if err
                .backend_cause()
                .is_some_and(|e| ctx.dialect.is_missing_table(e)) =>
        {
            ctx.schema.create_chunk(conn, ctx.dialect, ctx.lookup, chunk)?;
            insert_group(ctx.dialect, conn, chunk, events)
        }
        Err(err) => Err(err),
    }
}

fn insert_group(
    dialect: &dyn Dialect,
    conn: &Connection,
    chunk: &ChunkDescriptor,
    events: &[&Event],
) -> Result<usize> {
    let sql = insert_sql(dialect, chunk);
    let mut stmt = conn.prepare_cached(&sql)?;
    for event in events {
        stmt.execute(params_from_iter(row_values(chunk, event)?))?;
    }
    Ok(events.len())
}

/// `INSERT INTO chunk (ts, payload, <value columns>) VALUES (?, ...)`.
pub(crate) fn insert_sql(dialect: &dyn Dialect, chunk: &ChunkDescriptor) -> String {
    let mut columns = Vec::with_capacity(chunk.columns.len() + 1);
    for spec in &chunk.columns {
        if spec.kind == KeyKind::Timestamp {
            columns.push(dialect.quote_ident(&spec.column));
            columns.push(dialect.quote_ident(PAYLOAD_COLUMN));
        } else {
            columns.push(dialect.quote_ident(&spec.column));
        }
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote_ident(&chunk.table),
        columns.join(", "),
        placeholders
    )
}

fn row_values(chunk: &ChunkDescriptor, event: &Event) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(chunk.columns.len() + 1);
    for spec in &chunk.columns {
        match spec.kind {
            KeyKind::Timestamp => {
                values.push(Value::Integer(event.timestamp_ms));
                values.push(match &event.payload {
                    Some(bytes) => Value::Blob(bytes.clone()),
                    None => Value::Null,
                });
            }
            KeyKind::Metadata => {
                let value = event.metadata.get(&spec.key).ok_or_else(|| {
                    Error::InvalidEvent(format!("metadata '{}' missing", spec.key))
                })?;
                values.push(Value::Text(value.clone()));
            }
            KeyKind::Dimension => {
                let value = event.dimensions.get(&spec.key).ok_or_else(|| {
                    Error::InvalidEvent(format!("dimension '{}' missing", spec.key))
                })?;
                values.push(Value::Real(*value));
            }
        }
    }
    Ok(values)
}

/// Layout a single event would be written to.
pub fn chunk_for(schema: &SchemaRegistry, namespace: &Namespace, event: &Event) -> Arc<ChunkDescriptor> {
    schema
        .resolve(namespace, &ChunkId::of(event, schema.window_ms()))
        .0
}
