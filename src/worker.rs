//! Bounded worker pool for long-running operations
//!
//! Captures and restores of large trees should not block the thread that
//! asked for them. [`WorkerPool`] wraps a fixed-size rayon pool: whole
//! operations are spawned onto it and return an [`OperationHandle`], while the
//! per-file work inside a capture fans out over the same threads, so the total
//! number of busy threads never exceeds the configured worker count.
//!
//! Cancellation is cooperative. Jobs receive a [`CancelToken`] and check it
//! between units of work; what "between" means is up to the job (a capture
//! checks between files, a restore between file writes).

use crate::error::{Result, RewindError};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`RewindError::Cancelled`] if cancellation was requested
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(RewindError::Cancelled(operation.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Handle to an operation running on the worker pool
#[derive(Debug)]
pub struct OperationHandle<T> {
    cancel: CancelToken,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> OperationHandle<T> {
    /// Request cancellation of the running operation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token shared with the running operation
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block the current thread until the operation finishes
    ///
    /// Must not be called from inside an async runtime; use
    /// [`join`](Self::join) there.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(worker_lost()))
    }

    /// Await the operation's result
    pub async fn join(self) -> Result<T> {
        self.rx.await.unwrap_or_else(|_| Err(worker_lost()))
    }
}

fn worker_lost() -> RewindError {
    RewindError::ThreadPool("worker exited without reporting a result".to_string())
}

/// Fixed-size pool shared by every operation of an engine
#[derive(Debug)]
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl WorkerPool {
    /// Build a pool with `workers` threads (at least one)
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("rewind-worker-{}", i))
            .build()
            .map_err(|e| RewindError::ThreadPool(e.to_string()))?;
        debug!("Started worker pool with {} threads", workers);
        Ok(Self { pool, workers })
    }

    /// Number of threads in the pool
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `op` inside the pool so parallel iterators use its threads
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }

    /// Run `job` on the pool without blocking the caller
    pub fn spawn<T, F>(&self, job: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let (tx, rx) = oneshot::channel();
        let token = cancel.clone();
        self.pool.spawn(move || {
            let result = job(&token);
            // Receiver may have been dropped; the result is simply discarded then
            let _ = tx.send(result);
        });
        OperationHandle { cancel, rx }
    }

    /// Apply `f` to every item with at most `workers` running at once
    ///
    /// Returns only after every item has finished, in input order. Errors do
    /// not short-circuit: each item reports its own result.
    pub fn map_all<I, T, F>(&self, items: Vec<I>, f: F) -> Vec<Result<T>>
    where
        I: Send,
        T: Send,
        F: Fn(I) -> Result<T> + Send + Sync,
    {
        let count = items.len();
        let results = self.pool.install(|| items.into_par_iter().map(&f).collect::<Vec<_>>());
        trace!("Join-all barrier passed for {} items", count);
        results
    }
}
