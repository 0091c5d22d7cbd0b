//! Reusable per-namespace connections for fan-out jobs.
//!
//! Opening a namespace connection runs the dialect's setup every time, so jobs
//! borrow an idle one instead and hand it back when their statement is done.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;

use crate::backend::{Dialect, NamespaceRegistry};
use crate::event::Namespace;
use crate::Result;

#[derive(Default)]
struct IdleSet {
    /// Bumped whenever the namespace's database is released.
    generation: u64,
    conns: Vec<Connection>,
}

/// A connection borrowed from a [`ConnectionCache`].
pub struct Lease {
    conn: Connection,
    generation: u64,
}

impl Lease {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Idle connections per namespace, at most `max_idle` each.
pub struct ConnectionCache {
    registry: Arc<dyn NamespaceRegistry>,
    idle: Mutex<HashMap<Namespace, IdleSet>>,
    max_idle: usize,
}

impl ConnectionCache {
    pub fn new(registry: Arc<dyn NamespaceRegistry>, max_idle: usize) -> Self {
        Self {
            registry,
            idle: Mutex::new(HashMap::new()),
            max_idle,
        }
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.registry.dialect()
    }

    fn idle(&self) -> MutexGuard<'_, HashMap<Namespace, IdleSet>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An idle connection of `namespace`, or a freshly opened one.
    pub fn checkout(&self, namespace: &Namespace) -> Result<Lease> {
        let generation = {
            let mut idle = self.idle();
            match idle.get_mut(namespace) {
                Some(set) => {
                    if let Some(conn) = set.conns.pop() {
                        return Ok(Lease {
                            conn,
                            generation: set.generation,
                        });
                    }
                    set.generation
                }
                None => 0,
            }
        };
        let conn = self.registry.connect(namespace)?;
        Ok(Lease { conn, generation })
    }

    /// Return a leased connection. Leases taken before the namespace was
    /// released are closed instead of kept.
    pub fn checkin(&self, namespace: &Namespace, lease: Lease) {
        let mut idle = self.idle();
        let set = idle.entry(namespace.clone()).or_default();
        if set.generation == lease.generation && set.conns.len() < self.max_idle {
            set.conns.push(lease.conn);
        }
    }

    /// Close every idle connection of `namespace` and disown outstanding leases.
    pub fn evict(&self, namespace: &Namespace) {
        let mut idle = self.idle();
        let set = idle.entry(namespace.clone()).or_default();
        set.generation += 1;
        let closed = std::mem::take(&mut set.conns).len();
        if closed > 0 {
            log::debug!("closed {} idle connections of {}", closed, namespace);
        }
    }

    pub fn idle_count(&self, namespace: &Namespace) -> usize {
        self.idle().get(namespace).map_or(0, |set| set.conns.len())
    }
}

impl fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idle: usize = self.idle().values().map(|set| set.conns.len()).sum();
        f.debug_struct("ConnectionCache")
            .field("idle", &idle)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteRegistry;
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache(max_idle: usize) -> (TempDir, ConnectionCache, Namespace) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = SqliteRegistry::new(dir.path(), Duration::from_secs(1));
        registry.initialize().expect("initialize");
        let ns = Namespace::new("metrics").expect("namespace");
        registry.create(&ns).expect("create");
        (dir, ConnectionCache::new(Arc::new(registry), max_idle), ns)
    }

    fn has_marker(conn: &Connection) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_temp_master WHERE name = 'lease_marker'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .expect("temp schema")
            == 1
    }

    #[test]
    fn test_checkin_makes_connection_reusable() {
        let (_dir, cache, ns) = cache(2);
        let lease = cache.checkout(&ns).expect("checkout");
        lease
            .conn()
            .execute_batch("CREATE TEMP TABLE lease_marker(x)")
            .expect("marker");
        cache.checkin(&ns, lease);
        assert_eq!(cache.idle_count(&ns), 1);

        // Temp tables are per connection, so the marker proves reuse.
        let again = cache.checkout(&ns).expect("checkout");
        assert!(has_marker(again.conn()));
        assert_eq!(cache.idle_count(&ns), 0);
    }

    #[test]
    fn test_idle_connections_are_bounded() {
        let (_dir, cache, ns) = cache(1);
        let a = cache.checkout(&ns).expect("checkout");
        let b = cache.checkout(&ns).expect("checkout");
        cache.checkin(&ns, a);
        cache.checkin(&ns, b);
        assert_eq!(cache.idle_count(&ns), 1);
    }

    #[test]
    fn test_evict_disowns_outstanding_leases() {
        let (_dir, cache, ns) = cache(4);
        let idle = cache.checkout(&ns).expect("checkout");
        let outstanding = cache.checkout(&ns).expect("checkout");
        cache.checkin(&ns, idle);

        cache.evict(&ns);
        assert_eq!(cache.idle_count(&ns), 0);
        cache.checkin(&ns, outstanding);
        assert_eq!(cache.idle_count(&ns), 0);

        // Leases taken after the eviction are kept again.
        let fresh = cache.checkout(&ns).expect("checkout");
        assert!(!has_marker(fresh.conn()));
        cache.checkin(&ns, fresh);
        assert_eq!(cache.idle_count(&ns), 1);
    }

    #[test]
    fn test_checkout_of_unknown_namespace_fails() {
        let (_dir, cache, _ns) = cache(1);
        let missing = Namespace::new("missing").expect("namespace");
        assert!(matches!(
            cache.checkout(&missing),
            Err(crate::Error::NamespaceNotFound(_))
        ));
    }
}
