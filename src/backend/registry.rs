//! Namespace to database mapping.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};

use crate::backend::{Dialect, SqliteDialect};
use crate::event::Namespace;
use crate::{Error, Result};

/// Catalog database listing the registered namespaces.
pub const CATALOG_FILE: &str = "_catalog.db";

/// Resolves namespaces to physical databases.
pub trait NamespaceRegistry: Send + Sync {
    /// One-time bootstrap of the registry's own metadata.
    fn initialize(&self) -> Result<()>;

    /// Register a namespace and create its database.
    fn create(&self, namespace: &Namespace) -> Result<()>;

    /// Unregister a namespace and release its database.
    fn remove(&self, namespace: &Namespace) -> Result<()>;

    fn exists(&self, namespace: &Namespace) -> Result<bool>;

    fn list(&self) -> Result<Vec<Namespace>>;

    /// Open a connection to the namespace's database, prepared by the dialect.
    fn connect(&self, namespace: &Namespace) -> Result<Connection>;

    fn dialect(&self) -> &dyn Dialect;
}

/// One SQLite file per namespace under a root directory.
#[derive(Debug)]
pub struct SqliteRegistry {
    root: PathBuf,
    dialect: SqliteDialect,
    busy_timeout: Duration,
}

impl SqliteRegistry {
    pub fn new(root: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            dialect: SqliteDialect,
            busy_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn database_path(&self, namespace: &Namespace) -> PathBuf {
        self.root.join(format!("{}.db", namespace.as_str()))
    }

    fn open(&self, path: &Path, create: bool) -> Result<Connection> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    fn catalog(&self) -> Result<Connection> {
        self.open(&self.root.join(CATALOG_FILE), false)
    }
}

impl NamespaceRegistry for SqliteRegistry {
    fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let conn = self.open(&self.root.join(CATALOG_FILE), true)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS namespaces (
                name TEXT PRIMARY KEY,
                created_at_ms INTEGER NOT NULL
             );",
        )?;
        log::debug!("namespace catalog ready at {}", self.root.display());
        Ok(())
    }

    fn create(&self, namespace: &Namespace) -> Result<()> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let mut catalog = self.catalog()?;
        let tx = catalog.transaction()?;
        match tx.execute(
            "INSERT INTO namespaces (name, created_at_ms) VALUES (?1, ?2)",
            params![namespace.as_str(), now_ms],
        ) {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(Error::NamespaceExists(namespace.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        // The database must exist before the namespace becomes visible.
        let conn = self.open(&self.database_path(namespace), true)?;
        self.dialect.prepare_connection(&conn)?;
        drop(conn);
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, namespace: &Namespace) -> Result<()> {
        let removed = self.catalog()?.execute(
            "DELETE FROM namespaces WHERE name = ?1",
            params![namespace.as_str()],
        )?;
        if removed == 0 {
            return Err(Error::NamespaceNotFound(namespace.to_string()));
        }
        let db = self.database_path(namespace);
        for suffix in ["", "-wal", "-shm"] {
            let mut path = db.clone().into_os_string();
            path.push(suffix);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn exists(&self, namespace: &Namespace) -> Result<bool> {
        let found = self
            .catalog()?
            .query_row(
                "SELECT 1 FROM namespaces WHERE name = ?1",
                params![namespace.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn list(&self) -> Result<Vec<Namespace>> {
        let catalog = self.catalog()?;
        let mut stmt = catalog.prepare("SELECT name FROM namespaces ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names.into_iter().map(Namespace::new).collect()
    }

    fn connect(&self, namespace: &Namespace) -> Result<Connection> {
        let path = self.database_path(namespace);
        if !path.exists() {
            return Err(Error::NamespaceNotFound(namespace.to_string()));
        }
        let conn = self.open(&path, false)?;
        self.dialect.prepare_connection(&conn)?;
        Ok(conn)
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }
}
