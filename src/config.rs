//! Store configuration.
//!
//! Defines the options for an event store: chunk window size, naming, fan-out sizing,
//! deadlines and conflict retry.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::RetryPolicy;
use crate::fanout::FailurePolicy;
use crate::{Error, Result};

/// One day in milliseconds.
pub const DAY_MS: i64 = 86_400_000;

/// SQLite refuses compound selects with more terms than this.
const MAX_AGGREGATE_BATCH: usize = 500;

/// Configuration for an event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one database file per namespace plus the catalog.
    pub root: PathBuf,

    /// Chunk window size in milliseconds.
    /// Default: one day
    pub window_ms: i64,

    /// Prefix of every chunk table name.
    /// Default: "ev_"
    pub table_prefix: String,

    /// Name of the per-namespace lookup table.
    /// Default: "_strata_lookup"
    pub lookup_table: String,

    /// Threads in the shared fan-out pool.
    /// Default: 8
    pub fanout_workers: usize,

    /// Deadline for a fanned-out read in milliseconds.
    /// Default: 30 s
    pub query_timeout_ms: u64,

    /// How long a connection waits on a locked database before reporting a conflict.
    /// Default: 5 s
    pub busy_timeout_ms: u64,

    /// Maximum chunk sub-selects joined into one aggregate statement.
    /// Default: 200
    pub aggregate_batch_size: usize,

    /// How fan-out operations treat a failed chunk.
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Retry applied to lock conflicts on the write path.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./strata-data"),
            window_ms: DAY_MS,
            table_prefix: "ev_".to_string(),
            lookup_table: "_strata_lookup".to_string(),
            fanout_workers: 8,
            query_timeout_ms: 30_000,
            busy_timeout_ms: 5_000,
            aggregate_batch_size: 200,
            failure_policy: FailurePolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_ms <= 0 {
            return Err(Error::Config("window_ms must be positive".to_string()));
        }
        if self.fanout_workers == 0 {
            return Err(Error::Config("fanout_workers must be at least 1".to_string()));
        }
        if self.aggregate_batch_size == 0 || self.aggregate_batch_size > MAX_AGGREGATE_BATCH {
            return Err(Error::Config(format!(
                "aggregate_batch_size must be between 1 and {MAX_AGGREGATE_BATCH}"
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        for (field, ident) in [
            ("table_prefix", &self.table_prefix),
            ("lookup_table", &self.lookup_table),
        ] {
            let valid = !ident.is_empty()
                && ident
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !ident.starts_with(|c: char| c.is_ascii_digit());
            if !valid {
                return Err(Error::Config(format!(
                    "{field} must be a plain SQL identifier, got '{ident}'"
                )));
            }
        }
        if self.lookup_table.starts_with(&self.table_prefix) {
            return Err(Error::Config(
                "lookup_table must not share the chunk table prefix".to_string(),
            ));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
