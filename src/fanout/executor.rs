//! Per-chunk statements for get, delete, metadata and aggregate.
//!
//! Each job borrows a connection to the namespace database, registers it with
//! the fan-out's cancel token and runs exactly one statement. Results are merged
//! on the calling thread.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::aggregate::{finalize_buckets, merge_buckets, AggregateFunction, Buckets, PartialAggregate};
use crate::backend::{Dialect, NamespaceRegistry, RetryPolicy};
use crate::chunk::{ChunkDescriptor, KeyKind, PAYLOAD_COLUMN, TIMESTAMP_COLUMN};
use crate::event::{Event, Namespace};
use crate::fanout::connections::ConnectionCache;
use crate::fanout::{fan_out, CancelToken, FailurePolicy, WorkerPool};
use crate::query::{EventQuery, Filter};
use crate::{Error, Result};

/// A row read from one chunk, with the keys of the global sort order.
struct ChunkRow {
    timestamp_ms: i64,
    rowid: i64,
    event: Event,
}

/// Runs read-side operations over a set of planned chunks.
pub struct ChunkExecutor {
    connections: Arc<ConnectionCache>,
    pool: Arc<WorkerPool>,
    timeout: Duration,
    policy: FailurePolicy,
    retry: RetryPolicy,
    aggregate_batch_size: usize,
}

impl ChunkExecutor {
    pub fn new(
        registry: Arc<dyn NamespaceRegistry>,
        pool: Arc<WorkerPool>,
        timeout: Duration,
        policy: FailurePolicy,
        retry: RetryPolicy,
        aggregate_batch_size: usize,
    ) -> Self {
        // One idle connection per worker covers a fully busy pool.
        let connections = Arc::new(ConnectionCache::new(registry, pool.size()));
        Self {
            connections,
            pool,
            timeout,
            policy,
            retry,
            aggregate_batch_size: aggregate_batch_size.max(1),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Close the cached connections of a namespace whose database went away.
    pub fn forget_namespace(&self, namespace: &Namespace) {
        self.connections.evict(namespace);
    }

    pub fn idle_connections(&self, namespace: &Namespace) -> usize {
        self.connections.idle_count(namespace)
    }

    /// Matching events of every chunk, globally sorted, limit applied after the merge.
    pub fn get(
        &self,
        namespace: &Namespace,
        mut chunks: Vec<ChunkDescriptor>,
        query: &EventQuery,
        filter: &Filter,
    ) -> Result<Vec<Event>> {
        if query.limit == Some(0) {
            return Ok(Vec::new());
        }
        // Table order is the secondary sort key.
        chunks.sort_by(|a, b| a.table.cmp(&b.table));
        let items = indexed(chunks);
        let connections = Arc::clone(&self.connections);
        let ns = namespace.clone();
        let filter = filter.clone();
        let (start, end) = (query.start_ms, query.end_ms);
        let (payloads, ascending, limit) = (query.include_payloads, query.ascending, query.limit);

        let fanout = fan_out(&self.pool, items, self.timeout, move |(index, chunk), token| {
            with_connection(&connections, &ns, token, |conn, dialect| {
                let read = ChunkRead {
                    chunk: &chunk,
                    filter: &filter,
                    start,
                    end,
                    payloads,
                    ascending,
                    limit,
                };
                Ok((index, read_chunk(conn, dialect, &read, token)?))
            })
        })?;
        log::debug!(
            "get {}: {} chunks in {:?}, {} failed",
            namespace,
            fanout.outcomes.len(),
            fanout.elapsed,
            fanout.failures()
        );

        let mut rows: Vec<(usize, ChunkRow)> = fanout
            .resolve(self.policy)?
            .into_iter()
            .flat_map(|(index, rows)| rows.into_iter().map(move |row| (index, row)))
            .collect();
        rows.sort_by(|(ia, a), (ib, b)| {
            a.timestamp_ms
                .cmp(&b.timestamp_ms)
                .then(ia.cmp(ib))
                .then(a.rowid.cmp(&b.rowid))
        });
        if !query.ascending {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows.into_iter().map(|(_, row)| row.event).collect())
    }

    /// Delete matching rows from every chunk. Returns the number of rows removed.
    pub fn delete(
        &self,
        namespace: &Namespace,
        chunks: Vec<ChunkDescriptor>,
        query: &EventQuery,
        filter: &Filter,
    ) -> Result<usize> {
        let items = labelled(chunks);
        let connections = Arc::clone(&self.connections);
        let ns = namespace.clone();
        let filter = filter.clone();
        let retry = self.retry;
        let (start, end) = (query.start_ms, query.end_ms);

        let fanout = fan_out(&self.pool, items, self.timeout, move |chunk, token| {
            with_connection(&connections, &ns, token, |conn, dialect| {
                let (clause, params) = where_clause(dialect, &chunk, &filter, start, end)?;
                let sql = format!("DELETE FROM {} WHERE {}", dialect.quote_ident(&chunk.table), clause);
                retry.run(dialect, "delete", || {
                    Ok(conn.execute(&sql, params_from_iter(params.iter()))?)
                })
            })
        })?;
        let deleted: usize = fanout.resolve(self.policy)?.into_iter().sum();
        log::debug!("delete {}: removed {} rows", namespace, deleted);
        Ok(deleted)
    }

    /// Distinct values of one metadata key across every chunk.
    pub fn metadata(
        &self,
        namespace: &Namespace,
        chunks: Vec<ChunkDescriptor>,
        key: &str,
        query: &EventQuery,
        filter: &Filter,
    ) -> Result<BTreeSet<String>> {
        let items = labelled(chunks);
        let connections = Arc::clone(&self.connections);
        let ns = namespace.clone();
        let filter = filter.clone();
        let key = key.to_string();
        let (start, end) = (query.start_ms, query.end_ms);

        let fanout = fan_out(&self.pool, items, self.timeout, move |chunk, token| {
            with_connection(&connections, &ns, token, |conn, dialect| {
                let column = chunk.column_for(KeyKind::Metadata, &key).ok_or_else(|| {
                    Error::InvalidQuery(format!("chunk {} has no metadata '{}'", chunk.table, key))
                })?;
                let (clause, params) = where_clause(dialect, &chunk, &filter, start, end)?;
                let column = dialect.quote_ident(column);
                let sql = format!(
                    "SELECT DISTINCT {column} FROM {} WHERE {clause} AND {column} IS NOT NULL",
                    dialect.quote_ident(&chunk.table)
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params_from_iter(params.iter()))?;
                let mut values = Vec::new();
                while let Some(row) = rows.next()? {
                    token.check()?;
                    values.push(row.get::<_, String>(0)?);
                }
                Ok(values)
            })
        })?;

        let mut distinct = BTreeSet::new();
        for values in fanout.resolve(self.policy)? {
            distinct.extend(values);
        }
        Ok(distinct)
    }

    /// Bucketed aggregate of one dimension.
    ///
    /// Chunks are grouped into batches; each batch is one `UNION ALL` statement
    /// returning per-bucket partials, and the partials are merged here.
    #[allow(clippy::too_many_arguments)]
    pub fn aggregate(
        &self,
        namespace: &Namespace,
        chunks: Vec<ChunkDescriptor>,
        dimension: &str,
        query: &EventQuery,
        filter: &Filter,
        interval_ms: i64,
        function: AggregateFunction,
    ) -> Result<BTreeMap<i64, f64>> {
        let batches: Vec<(String, Vec<ChunkDescriptor>)> = chunks
            .chunks(self.aggregate_batch_size)
            .map(|batch| (batch_label(batch), batch.to_vec()))
            .collect();
        let connections = Arc::clone(&self.connections);
        let ns = namespace.clone();
        let filter = filter.clone();
        let target = dimension.to_string();
        let (start, end) = (query.start_ms, query.end_ms);

        let fanout = fan_out(&self.pool, batches, self.timeout, move |batch, token| {
            with_connection(&connections, &ns, token, |conn, dialect| {
                let (sql, params) =
                    aggregate_sql(dialect, &batch, &target, &filter, start, end, interval_ms)?;
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params_from_iter(params.iter()))?;
                let mut buckets = Buckets::new();
                while let Some(row) = rows.next()? {
                    token.check()?;
                    let count: i64 = row.get(2)?;
                    if count == 0 {
                        continue;
                    }
                    let index: i64 = row.get(0)?;
                    buckets
                        .entry(bucket_from_index(index, interval_ms))
                        .or_default()
                        .merge(&PartialAggregate {
                            sum: row.get(1)?,
                            count: count as u64,
                            min: row.get(3)?,
                            max: row.get(4)?,
                        });
                }
                Ok(buckets)
            })
        })?;
        log::debug!(
            "aggregate {} {}({}): {} batches in {:?}",
            namespace,
            function,
            dimension,
            fanout.outcomes.len(),
            fanout.elapsed
        );

        let mut merged = Buckets::new();
        for buckets in fanout.resolve(self.policy)? {
            merge_buckets(&mut merged, buckets);
        }
        Ok(finalize_buckets(&merged, function))
    }
}

fn labelled(chunks: Vec<ChunkDescriptor>) -> Vec<(String, ChunkDescriptor)> {
    chunks.into_iter().map(|c| (c.table.clone(), c)).collect()
}

fn indexed(chunks: Vec<ChunkDescriptor>) -> Vec<(String, (usize, ChunkDescriptor))> {
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, c)| (c.table.clone(), (i, c)))
        .collect()
}

fn batch_label(batch: &[ChunkDescriptor]) -> String {
    match batch {
        [] => String::new(),
        [only] => only.table.clone(),
        [first, .., last] => format!("{}..{} ({} chunks)", first.table, last.table, batch.len()),
    }
}

/// Borrow a watched connection and run `f`; failures caused by cancellation
/// surface as [`Error::Cancelled`].
///
/// The connection goes back to the cache unless the fan-out was cancelled
/// while it was in use.
fn with_connection<T>(
    connections: &ConnectionCache,
    namespace: &Namespace,
    token: &CancelToken,
    f: impl FnOnce(&Connection, &dyn Dialect) -> Result<T>,
) -> Result<T> {
    let lease = connections.checkout(namespace)?;
    let result = {
        let _watch = token.watch(lease.conn());
        token
            .check()
            .and_then(|()| f(lease.conn(), connections.dialect()))
    };
    if token.is_cancelled() {
        return result.map_err(|_| Error::Cancelled);
    }
    connections.checkin(namespace, lease);
    result
}

/// `ts >= ? AND ts <= ? AND <predicates>` for one chunk.
fn where_clause(
    dialect: &dyn Dialect,
    chunk: &ChunkDescriptor,
    filter: &Filter,
    start: i64,
    end: i64,
) -> Result<(String, Vec<Value>)> {
    let fragment = filter.to_sql(chunk, dialect)?;
    let ts = dialect.quote_ident(TIMESTAMP_COLUMN);
    let mut params = Vec::with_capacity(2 + fragment.params.len());
    params.push(Value::Integer(start));
    params.push(Value::Integer(end));
    params.extend(fragment.params);
    Ok((format!("{ts} >= ? AND {ts} <= ? AND ({})", fragment.sql), params))
}

struct ChunkRead<'a> {
    chunk: &'a ChunkDescriptor,
    filter: &'a Filter,
    start: i64,
    end: i64,
    payloads: bool,
    ascending: bool,
    limit: Option<usize>,
}

fn read_chunk(
    conn: &Connection,
    dialect: &dyn Dialect,
    read: &ChunkRead<'_>,
    token: &CancelToken,
) -> Result<Vec<ChunkRow>> {
    let chunk = read.chunk;
    let value_columns: Vec<_> = chunk.value_columns().collect();
    let mut projection = vec![
        "rowid".to_string(),
        dialect.quote_ident(TIMESTAMP_COLUMN),
    ];
    if read.payloads {
        projection.push(dialect.quote_ident(PAYLOAD_COLUMN));
    }
    projection.extend(value_columns.iter().map(|c| dialect.quote_ident(&c.column)));

    let (clause, mut params) = where_clause(dialect, chunk, read.filter, read.start, read.end)?;
    let direction = if read.ascending { "ASC" } else { "DESC" };
    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {} {direction}, rowid {direction}",
        projection.join(", "),
        dialect.quote_ident(&chunk.table),
        clause,
        dialect.quote_ident(TIMESTAMP_COLUMN),
    );
    // Rows past the global limit in this chunk can never make the merged result.
    if let Some(limit) = read.limit {
        sql.push_str(" LIMIT ?");
        params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let offset = if read.payloads { 3 } else { 2 };
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        token.check()?;
        let timestamp_ms: i64 = row.get(1)?;
        let mut event = Event::new(timestamp_ms);
        if read.payloads {
            event.payload = row.get::<_, Option<Vec<u8>>>(2)?;
        }
        for (i, spec) in value_columns.iter().enumerate() {
            match spec.kind {
                KeyKind::Metadata => {
                    if let Some(value) = row.get::<_, Option<String>>(offset + i)? {
                        event.metadata.insert(spec.key.clone(), value);
                    }
                }
                KeyKind::Dimension => {
                    if let Some(value) = row.get::<_, Option<f64>>(offset + i)? {
                        event.dimensions.insert(spec.key.clone(), value);
                    }
                }
                KeyKind::Timestamp => {}
            }
        }
        out.push(ChunkRow {
            timestamp_ms,
            rowid: row.get(0)?,
            event,
        });
    }
    Ok(out)
}

/// One statement aggregating a batch of chunks into per-bucket partials.
///
/// Rows are grouped by bucket index, the floored quotient of timestamp and
/// interval, so pre-epoch timestamps land in the bucket that starts at or before
/// them. The index never overflows; [`bucket_from_index`] turns it into a start.
fn aggregate_sql(
    dialect: &dyn Dialect,
    batch: &[ChunkDescriptor],
    dimension: &str,
    filter: &Filter,
    start: i64,
    end: i64,
    interval_ms: i64,
) -> Result<(String, Vec<Value>)> {
    let ts = dialect.quote_ident(TIMESTAMP_COLUMN);
    let mut params = vec![Value::Integer(interval_ms)];
    let mut selects = Vec::with_capacity(batch.len());
    for chunk in batch {
        let column = chunk.column_for(KeyKind::Dimension, dimension).ok_or_else(|| {
            Error::InvalidQuery(format!("chunk {} has no dimension '{}'", chunk.table, dimension))
        })?;
        let (clause, chunk_params) = where_clause(dialect, chunk, filter, start, end)?;
        selects.push(format!(
            "SELECT {ts} AS ts, {} AS v FROM {} WHERE {clause}",
            dialect.quote_ident(column),
            dialect.quote_ident(&chunk.table)
        ));
        params.extend(chunk_params);
    }
    let sql = format!(
        "SELECT (ts / ?1) - (CASE WHEN ts % ?1 < 0 THEN 1 ELSE 0 END) AS bucket_index, \
         SUM(v), COUNT(v), MIN(v), MAX(v) FROM ({}) GROUP BY bucket_index",
        selects.join(" UNION ALL ")
    );
    Ok((sql, params))
}

/// Start of the bucket with the given index, clamped like chunk windows.
fn bucket_from_index(index: i64, interval_ms: i64) -> i64 {
    index.saturating_mul(interval_ms)
}
