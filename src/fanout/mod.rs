//! Concurrent per-chunk execution.
//!
//! Every read-side operation runs one independent statement per chunk (or per
//! batch of chunks) on the store's shared [`WorkerPool`], waits for all of them
//! under one deadline, then resolves the per-chunk outcomes with the store's
//! [`FailurePolicy`].

mod connections;
mod executor;
mod pool;

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use executor::ChunkExecutor;
pub use pool::{CancelToken, Watch, WorkerPool};

use crate::{Error, Result};

/// How a fan-out treats chunks that failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first failed chunk fails the whole call.
    #[default]
    FailFast,
    /// Failed chunks are logged and contribute nothing.
    BestEffort,
}

/// Result of one unit of fan-out work.
#[derive(Debug)]
pub struct ChunkOutcome<T> {
    pub table: String,
    pub result: Result<T>,
}

/// All outcomes of a fan-out, in submission order.
#[derive(Debug)]
pub struct Fanout<T> {
    pub outcomes: Vec<ChunkOutcome<T>>,
    pub elapsed: Duration,
}

impl<T> Fanout<T> {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    /// Every value, or the first failure tagged with its chunk.
    pub fn into_strict(self) -> Result<Vec<T>> {
        self.outcomes
            .into_iter()
            .map(|o| o.result.map_err(|e| e.in_chunk(o.table)))
            .collect()
    }

    /// Values of the chunks that succeeded; failures are logged.
    pub fn into_partial(self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.outcomes.len());
        for outcome in self.outcomes {
            match outcome.result {
                Ok(value) => values.push(value),
                Err(err) => log::warn!("skipping chunk {}: {}", outcome.table, err),
            }
        }
        values
    }

    pub fn resolve(self, policy: FailurePolicy) -> Result<Vec<T>> {
        match policy {
            FailurePolicy::FailFast => self.into_strict(),
            FailurePolicy::BestEffort => Ok(self.into_partial()),
        }
    }
}

/// Run `task` once per item on `pool` and wait for all of them.
///
/// If `timeout` passes first the shared token is cancelled, which stops queued
/// items and interrupts watched connections, and the call fails with
/// [`Error::Timeout`] regardless of what already completed.
pub fn fan_out<I, T, F>(
    pool: &WorkerPool,
    items: Vec<(String, I)>,
    timeout: Duration,
    task: F,
) -> Result<Fanout<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I, &CancelToken) -> Result<T> + Send + Sync + 'static,
{
    let start = Instant::now();
    if items.is_empty() {
        return Ok(Fanout {
            outcomes: Vec::new(),
            elapsed: start.elapsed(),
        });
    }
    let deadline = start + timeout;
    let token = CancelToken::new();
    let task = Arc::new(task);
    let (tx, rx) = mpsc::channel::<(usize, Result<T>)>();

    let mut labels = Vec::with_capacity(items.len());
    for (index, (label, item)) in items.into_iter().enumerate() {
        labels.push(label);
        let tx = tx.clone();
        let task = Arc::clone(&task);
        let job_token = token.clone();
        let queued = pool.execute(move || {
            let result = match job_token.check() {
                Ok(()) => panic::catch_unwind(AssertUnwindSafe(|| task(item, &job_token)))
                    .unwrap_or(Err(Error::WorkerPool("chunk task panicked"))),
                Err(err) => Err(err),
            };
            // The caller may have given up already.
            let _ = tx.send((index, result));
        });
        if let Err(err) = queued {
            token.cancel();
            return Err(err);
        }
    }
    drop(tx);

    let mut results: Vec<Option<Result<T>>> = labels.iter().map(|_| None).collect();
    let mut pending = labels.len();
    while pending > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((index, result)) => {
                results[index] = Some(result);
                pending -= 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                token.cancel();
                let elapsed = start.elapsed();
                log::warn!(
                    "fan-out deadline {:?} exceeded with {} of {} chunks pending",
                    timeout,
                    pending,
                    labels.len()
                );
                return Err(Error::Timeout { elapsed });
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let outcomes = labels
        .into_iter()
        .zip(results)
        .map(|(table, result)| ChunkOutcome {
            table,
            result: result.unwrap_or(Err(Error::WorkerPool("worker dropped a chunk task"))),
        })
        .collect();
    Ok(Fanout {
        outcomes,
        elapsed: start.elapsed(),
    })
}
