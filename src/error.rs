use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Any failure reported by the relational backend. Callers that need to tell
    /// a missing table from a lost connection inspect the source.
    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock conflict not resolved after {attempts} attempts")]
    ConflictExhausted { attempts: u32 },
    #[error("query deadline exceeded after {elapsed:?}")]
    Timeout { elapsed: Duration },
    #[error("query cancelled")]
    Cancelled,
    #[error("chunk {table} failed: {source}")]
    ChunkFailed {
        table: String,
        #[source]
        source: Box<Error>,
    },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    #[error("namespace already exists: {0}")]
    NamespaceExists(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("worker pool: {0}")]
    WorkerPool(&'static str),
}

impl Error {
    /// Wrap an error with the chunk table it came from.
    pub fn in_chunk(self, table: impl Into<String>) -> Self {
        Error::ChunkFailed {
            table: table.into(),
            source: Box::new(self),
        }
    }

    /// The backend error at the root of this failure, if any.
    pub fn backend_cause(&self) -> Option<&rusqlite::Error> {
        match self {
            Error::Backend(err) => Some(err),
            Error::ChunkFailed { source, .. } => source.backend_cause(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_failed_keeps_backend_cause() {
        let err = Error::Backend(rusqlite::Error::InvalidQuery).in_chunk("ev_20240101_a_b");
        assert!(err.to_string().contains("ev_20240101_a_b"));
        assert!(matches!(
            err.backend_cause(),
            Some(rusqlite::Error::InvalidQuery)
        ));
    }

    #[test]
    fn test_non_backend_has_no_cause() {
        let err = Error::InvalidQuery("bad".to_string());
        assert!(err.backend_cause().is_none());
    }
}
