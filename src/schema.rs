//! Schema registry.
//!
//! Content-addressed cache of chunk layouts keyed by `(namespace, window, schema
//! key)`, backed by the lookup table. Chunk tables are created lazily with
//! idempotent DDL and lookup upserts, so writers racing on the same new schema
//! all succeed without any cross-process lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use rusqlite::Connection;

use crate::backend::Dialect;
use crate::chunk::{ChunkDescriptor, ChunkId};
use crate::event::Namespace;
use crate::lookup::LookupTable;
use crate::Result;

type CacheKey = (Namespace, ChunkId);

#[derive(Debug)]
pub struct SchemaRegistry {
    prefix: String,
    window_ms: i64,
    known: RwLock<HashMap<CacheKey, Arc<ChunkDescriptor>>>,
}

impl SchemaRegistry {
    pub fn new(prefix: impl Into<String>, window_ms: i64) -> Self {
        Self {
            prefix: prefix.into(),
            window_ms,
            known: RwLock::new(HashMap::new()),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Layout for a chunk, and whether it is already known to exist.
    ///
    /// Unknown layouts are derived but not cached; call [`SchemaRegistry::remember`]
    /// once the creating transaction has committed.
    pub fn resolve(&self, namespace: &Namespace, id: &ChunkId) -> (Arc<ChunkDescriptor>, bool) {
        let key = (namespace.clone(), id.clone());
        if let Some(desc) = self
            .known
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return (Arc::clone(desc), true);
        }
        let desc = ChunkDescriptor::for_chunk(id, &self.prefix, self.window_ms);
        (Arc::new(desc), false)
    }

    /// Create the chunk table if missing and register its columns.
    ///
    /// Runs on the caller's connection so it joins the caller's transaction; a
    /// failure here rolls back together with the write that needed the chunk.
    pub fn create_chunk(
        &self,
        conn: &Connection,
        dialect: &dyn Dialect,
        lookup: &LookupTable,
        chunk: &ChunkDescriptor,
    ) -> Result<()> {
        conn.execute_batch(&dialect.chunk_table_ddl(chunk))?;
        lookup.register(conn, chunk)?;
        log::info!("created chunk {}", chunk);
        Ok(())
    }

    /// Cache layouts whose tables are now durable.
    pub fn remember(&self, namespace: &Namespace, chunks: Vec<(ChunkId, Arc<ChunkDescriptor>)>) {
        if chunks.is_empty() {
            return;
        }
        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        for (id, desc) in chunks {
            // Double-checked: another writer may have cached it meanwhile.
            known.entry((namespace.clone(), id)).or_insert(desc);
        }
    }

    /// Drop cached layouts for tables that no longer exist.
    pub fn forget(&self, namespace: &Namespace, tables: &[String]) {
        if tables.is_empty() {
            return;
        }
        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        known.retain(|(ns, _), desc| ns != namespace || !tables.contains(&desc.table));
    }

    /// Drop every cached layout of a namespace.
    pub fn forget_namespace(&self, namespace: &Namespace) {
        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        known.retain(|(ns, _), _| ns != namespace);
    }

    pub fn cached(&self) -> usize {
        self.known.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteDialect;
    use crate::config::DAY_MS;
    use crate::event::Event;

    #[test]
    fn test_resolve_and_remember() {
        let registry = SchemaRegistry::new("ev_", DAY_MS);
        let ns = Namespace::new("metrics").unwrap();
        let id = ChunkId::of(&Event::new(0).with_metadata("host", "a"), DAY_MS);

        let (desc, known) = registry.resolve(&ns, &id);
        assert!(!known);
        registry.remember(&ns, vec![(id.clone(), Arc::clone(&desc))]);

        let (again, known) = registry.resolve(&ns, &id);
        assert!(known);
        assert_eq!(again, desc);

        // Same chunk in another namespace is independent.
        let other = Namespace::new("logs").unwrap();
        assert!(!registry.resolve(&other, &id).1);

        registry.forget(&ns, &[desc.table.clone()]);
        assert!(!registry.resolve(&ns, &id).1);
        assert_eq!(registry.cached(), 0);
    }

    #[test]
    fn test_create_chunk_twice() {
        let conn = Connection::open_in_memory().unwrap();
        let lookup = LookupTable::new("_strata_lookup", &SqliteDialect);
        lookup.ensure(&conn, &SqliteDialect).unwrap();

        let registry = SchemaRegistry::new("ev_", DAY_MS);
        let ns = Namespace::new("metrics").unwrap();
        let id = ChunkId::of(&Event::new(0).with_dimension("cpu", 1.0), DAY_MS);
        let (desc, _) = registry.resolve(&ns, &id);

        registry.create_chunk(&conn, &SqliteDialect, &lookup, &desc).unwrap();
        registry.create_chunk(&conn, &SqliteDialect, &lookup, &desc).unwrap();

        assert_eq!(lookup.rows(&conn).unwrap().len(), 2);
        assert_eq!(lookup.chunks(&conn).unwrap(), vec![(*desc).clone()]);
    }

    #[test]
    fn test_forget_namespace() {
        let registry = SchemaRegistry::new("ev_", DAY_MS);
        let a = Namespace::new("a").unwrap();
        let b = Namespace::new("b").unwrap();
        let id = ChunkId::of(&Event::new(0), DAY_MS);
        let (desc, _) = registry.resolve(&a, &id);
        registry.remember(&a, vec![(id.clone(), Arc::clone(&desc))]);
        registry.remember(&b, vec![(id.clone(), desc)]);

        registry.forget_namespace(&a);
        assert_eq!(registry.cached(), 1);
        assert!(registry.resolve(&b, &id).1);
    }
}
