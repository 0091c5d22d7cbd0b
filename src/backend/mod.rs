//! Relational backend plumbing.
//!
//! The engine only needs three things from the backend, all behind small traits:
//!
//! 1. **Dialect**: DDL for chunk and lookup tables, the pattern match operator, and
//!    classification of backend errors.
//! 2. **NamespaceRegistry**: maps a namespace to its physical database and hands out
//!    connections.
//! 3. **RetryPolicy**: bounded backoff for lock conflicts.
//!
//! The shipped implementation targets SQLite, one database file per namespace.

mod dialect;
mod registry;
mod retry;

pub use dialect::{Dialect, SqliteDialect};
pub use registry::{NamespaceRegistry, SqliteRegistry, CATALOG_FILE};
pub use retry::RetryPolicy;
