//! The event store.
//!
//! [`EventStore`] ties the pieces together: the namespace registry hands out
//! connections, the planner picks candidate chunks from the lookup table, and the
//! executor fans statements out over the shared worker pool.
//!
//! ```no_run
//! use strata::{Event, EventQuery, EventStore, Namespace, StoreConfig};
//!
//! # fn main() -> strata::Result<()> {
//! let store = EventStore::initialize(StoreConfig::new("/var/lib/strata"))?;
//! let ns = Namespace::new("metrics")?;
//! store.create(&ns)?;
//!
//! store.store(
//!     &ns,
//!     &[Event::new(1_700_000_000_000)
//!         .with_metadata("host", "web-1")
//!         .with_dimension("cpu", 42.0)],
//! )?;
//!
//! let events = store.get(
//!     &ns,
//!     &EventQuery::new(1_700_000_000_000, 1_700_000_060_000).dimension("cpu", ">=40"),
//! )?;
//! assert_eq!(events.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rusqlite::Connection;

use crate::aggregate::AggregateFunction;
use crate::backend::{NamespaceRegistry, SqliteRegistry};
use crate::chunk::ChunkDescriptor;
use crate::config::StoreConfig;
use crate::event::{Event, Namespace};
use crate::expire::expire_before;
use crate::fanout::{ChunkExecutor, WorkerPool};
use crate::lookup::LookupTable;
use crate::query::{find_chunks, ChunkQuery, EventQuery, Filter};
use crate::schema::SchemaRegistry;
use crate::write::{write_batch, WriteContext};
use crate::{Error, Result};

pub struct EventStore {
    config: StoreConfig,
    registry: Arc<dyn NamespaceRegistry>,
    lookup: LookupTable,
    schema: SchemaRegistry,
    executor: ChunkExecutor,
}

impl EventStore {
    /// Bootstrap the catalog under `config.root` and start the worker pool.
    ///
    /// Call once per process; the returned store is shared by reference.
    pub fn initialize(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let registry = SqliteRegistry::new(config.root.clone(), config.busy_timeout());
        Self::with_registry(config, Arc::new(registry))
    }

    /// Like [`EventStore::initialize`] with a caller-supplied registry.
    pub fn with_registry(config: StoreConfig, registry: Arc<dyn NamespaceRegistry>) -> Result<Self> {
        config.validate()?;
        registry.initialize()?;
        let pool = Arc::new(WorkerPool::new(config.fanout_workers)?);
        let executor = ChunkExecutor::new(
            Arc::clone(&registry),
            pool,
            config.query_timeout(),
            config.failure_policy,
            config.retry,
            config.aggregate_batch_size,
        );
        let lookup = LookupTable::new(config.lookup_table.clone(), registry.dialect());
        let schema = SchemaRegistry::new(config.table_prefix.clone(), config.window_ms);
        log::info!(
            "event store ready: window={}ms workers={} policy={:?}",
            config.window_ms,
            config.fanout_workers,
            config.failure_policy
        );
        Ok(Self {
            config,
            registry,
            lookup,
            schema,
            executor,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Register a namespace and create its lookup table.
    pub fn create(&self, namespace: &Namespace) -> Result<()> {
        self.registry.create(namespace)?;
        self.executor.forget_namespace(namespace);
        let conn = self.registry.connect(namespace)?;
        self.lookup.ensure(&conn, self.registry.dialect())?;
        log::info!("created namespace {}", namespace);
        Ok(())
    }

    /// Remove a namespace with all of its chunks.
    pub fn drop_namespace(&self, namespace: &Namespace) -> Result<()> {
        self.executor.forget_namespace(namespace);
        self.registry.remove(namespace)?;
        self.schema.forget_namespace(namespace);
        log::info!("dropped namespace {}", namespace);
        Ok(())
    }

    pub fn namespaces(&self) -> Result<Vec<Namespace>> {
        self.registry.list()
    }

    /// Every chunk of a namespace, in table-name order.
    pub fn chunks(&self, namespace: &Namespace) -> Result<Vec<ChunkDescriptor>> {
        let conn = self.registry.connect(namespace)?;
        self.lookup.chunks(&conn)
    }

    /// Store a batch atomically. Returns the number of events written.
    pub fn store(&self, namespace: &Namespace, events: &[Event]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut conn = self.registry.connect(namespace)?;
        let ctx = WriteContext {
            dialect: self.registry.dialect(),
            lookup: &self.lookup,
            schema: &self.schema,
            retry: self.config.retry,
        };
        write_batch(&ctx, &mut conn, namespace, events)
    }

    /// Events matching the query, sorted by timestamp in the requested direction.
    pub fn get(&self, namespace: &Namespace, query: &EventQuery) -> Result<Vec<Event>> {
        let filter = query.filter()?;
        let Some(chunks) = self.plan(namespace, query, &filter, ChunkQuery::for_filter)? else {
            return Ok(Vec::new());
        };
        self.executor.get(namespace, chunks, query, &filter)
    }

    /// Earliest matching event.
    pub fn first(&self, namespace: &Namespace, query: &EventQuery) -> Result<Option<Event>> {
        let query = query.clone().ascending(true).limit(1);
        Ok(self.get(namespace, &query)?.into_iter().next())
    }

    /// Latest matching event.
    pub fn last(&self, namespace: &Namespace, query: &EventQuery) -> Result<Option<Event>> {
        let query = query.clone().ascending(false).limit(1);
        Ok(self.get(namespace, &query)?.into_iter().next())
    }

    /// Delete matching events. Ordering, limit and payload options are ignored.
    pub fn delete(&self, namespace: &Namespace, query: &EventQuery) -> Result<usize> {
        let filter = query.filter()?;
        let Some(chunks) = self.plan(namespace, query, &filter, ChunkQuery::for_filter)? else {
            return Ok(0);
        };
        self.executor.delete(namespace, chunks, query, &filter)
    }

    /// Bucketed aggregate of `dimension` over matching events.
    ///
    /// Bucket keys are bucket start timestamps; empty buckets are absent.
    pub fn aggregate(
        &self,
        namespace: &Namespace,
        dimension: &str,
        query: &EventQuery,
        interval_ms: i64,
        function: AggregateFunction,
    ) -> Result<BTreeMap<i64, f64>> {
        if interval_ms <= 0 {
            return Err(Error::InvalidQuery(format!(
                "aggregate interval must be positive, got {}",
                interval_ms
            )));
        }
        let filter = query.filter()?;
        let plan = |start, end, filter: &Filter| {
            ChunkQuery::for_filter(start, end, filter).require_dimension(dimension)
        };
        let Some(chunks) = self.plan(namespace, query, &filter, plan)? else {
            return Ok(BTreeMap::new());
        };
        self.executor
            .aggregate(namespace, chunks, dimension, query, &filter, interval_ms, function)
    }

    /// Distinct values of a metadata key over matching events.
    pub fn metadata(
        &self,
        namespace: &Namespace,
        key: &str,
        query: &EventQuery,
    ) -> Result<BTreeSet<String>> {
        let filter = query.filter()?;
        let plan = |start, end, filter: &Filter| {
            ChunkQuery::for_filter(start, end, filter).require_metadata(key)
        };
        let Some(chunks) = self.plan(namespace, query, &filter, plan)? else {
            return Ok(BTreeSet::new());
        };
        self.executor.metadata(namespace, chunks, key, query, &filter)
    }

    /// Drop every chunk whose window holds only timestamps at or before
    /// `cutoff_ms - window`. Returns the dropped tables.
    pub fn expire(&self, namespace: &Namespace, cutoff_ms: i64) -> Result<Vec<String>> {
        let mut conn = self.registry.connect(namespace)?;
        let dropped = expire_before(
            &mut conn,
            self.registry.dialect(),
            &self.lookup,
            &self.config.retry,
            cutoff_ms,
            self.config.window_ms,
        )?;
        self.schema.forget(namespace, &dropped);
        if !dropped.is_empty() {
            log::info!("expire {}: dropped {} chunks", namespace, dropped.len());
        }
        Ok(dropped)
    }

    /// Candidate chunks, or `None` when the range is empty.
    fn plan(
        &self,
        namespace: &Namespace,
        query: &EventQuery,
        filter: &Filter,
        chunk_query: impl FnOnce(i64, i64, &Filter) -> ChunkQuery,
    ) -> Result<Option<Vec<ChunkDescriptor>>> {
        let conn: Connection = self.registry.connect(namespace)?;
        if query.start_ms > query.end_ms {
            return Ok(None);
        }
        let chunks = find_chunks(
            &conn,
            &self.lookup,
            self.config.window_ms,
            &chunk_query(query.start_ms, query.end_ms, filter),
        )?;
        if chunks.is_empty() {
            return Ok(None);
        }
        Ok(Some(chunks))
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("root", &self.config.root)
            .field("window_ms", &self.config.window_ms)
            .field("cached_chunks", &self.schema.cached())
            .finish()
    }
}
