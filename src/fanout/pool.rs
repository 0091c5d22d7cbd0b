use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use rusqlite::{Connection, InterruptHandle};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads fed from one queue.
///
/// One pool is shared by every fan-out of a store, so concurrent callers queue
/// behind each other instead of spawning threads per call.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::WorkerPool("pool needs at least one worker"));
        }
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("strata-fanout-{}", worker_id))
                .spawn(move || worker_loop(&receiver))?;
            workers.push(handle);
        }
        log::debug!("started fan-out pool with {} workers", size);
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job. Panics inside the job are caught and logged.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(Error::WorkerPool("pool is shut down"));
        };
        sender
            .send(Box::new(job))
            .map_err(|_| Error::WorkerPool("all workers exited"))
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        // Hold the lock only while waiting for the next job.
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = next else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!(
                "fan-out job panicked on {}",
                thread::current().name().unwrap_or("worker")
            );
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets every worker drain and exit.
        drop(
            self.sender
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("fan-out worker exited abnormally");
            }
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field(
                "open",
                &self
                    .sender
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some(),
            )
            .finish()
    }
}

struct CancelState {
    cancelled: AtomicBool,
    next_watch: AtomicU64,
    handles: Mutex<Vec<(u64, InterruptHandle)>>,
}

impl CancelState {
    fn handles(&self) -> MutexGuard<'_, Vec<(u64, InterruptHandle)>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cooperative cancellation shared by the jobs of one fan-out.
///
/// Jobs check the flag between steps; connections registered with
/// [`CancelToken::watch`] are interrupted so that statements already running on
/// the backend stop as well.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                next_watch: AtomicU64::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, handle) in self.inner.handles().iter() {
            handle.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Interrupt `conn` when the token is cancelled, immediately if it already is.
    ///
    /// The connection stays watched until the returned guard drops, after which
    /// it can be handed to other work. An interrupt only reaches statements that
    /// are running, so callers still [`check`](CancelToken::check) before
    /// starting new work.
    pub fn watch(&self, conn: &Connection) -> Watch {
        let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        self.inner.handles().push((id, conn.get_interrupt_handle()));
        if self.is_cancelled() {
            conn.get_interrupt_handle().interrupt();
        }
        Watch {
            state: Arc::clone(&self.inner),
            id,
        }
    }

    /// Number of connections currently watched.
    pub fn watched(&self) -> usize {
        self.inner.handles().len()
    }
}

/// Registration of one connection with a [`CancelToken`].
#[must_use = "the connection is unwatched as soon as the guard drops"]
pub struct Watch {
    state: Arc<CancelState>,
    id: u64,
}

impl Drop for Watch {
    fn drop(&mut self) {
        let id = self.id;
        self.state.handles().retain(|(watched, _)| *watched != id);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("watched", &self.watched())
            .finish()
    }
}
