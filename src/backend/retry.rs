use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::Dialect;
use crate::{Error, Result};

/// Bounded exponential backoff for lock conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 5,
            max_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// No retry at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-conflict error, or the attempts
    /// run out. `op` must be safe to repeat: a failed attempt leaves no effects.
    pub fn run<T>(
        &self,
        dialect: &dyn Dialect,
        what: &str,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let conflict = err.backend_cause().is_some_and(|e| dialect.is_conflict(e));
            if !conflict {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                log::warn!("{what}: giving up after {attempt} conflicting attempts");
                return Err(Error::ConflictExhausted { attempts: attempt });
            }
            let delay = self.backoff(attempt);
            log::debug!("{what}: conflict on attempt {attempt}, retrying in {delay:?}");
            thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteDialect;
    use rusqlite::ffi;

    fn busy() -> Error {
        Error::Backend(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 5,
            max_backoff_ms: 30,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(5));
        assert_eq!(policy.backoff(2), Duration::from_millis(10));
        assert_eq!(policy.backoff(3), Duration::from_millis(20));
        assert_eq!(policy.backoff(4), Duration::from_millis(30));
        assert_eq!(policy.backoff(64), Duration::from_millis(30));
    }

    #[test]
    fn test_retry_until_success() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        };
        let mut calls = 0;
        let value = policy
            .run(&SqliteDialect, "test", || {
                calls += 1;
                if calls < 3 {
                    Err(busy())
                } else {
                    Ok(calls)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_retry_exhausted() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        };
        let mut calls = 0;
        let result: Result<()> = policy.run(&SqliteDialect, "test", || {
            calls += 1;
            Err(busy())
        });
        assert!(matches!(result, Err(Error::ConflictExhausted { attempts: 3 })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_non_conflict_not_retried() {
        let mut calls = 0;
        let result: Result<()> = RetryPolicy::default().run(&SqliteDialect, "test", || {
            calls += 1;
            Err(Error::InvalidQuery("bad".to_string()))
        });
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
        assert_eq!(calls, 1);
    }
}
