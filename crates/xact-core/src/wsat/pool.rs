//! Bounded worker pool for remote participant operations.
//!
//! One multi-threaded tokio runtime is shared by every remote participant in
//! the process. A semaphore caps the number of operations in flight and
//! every operation carries its own timeout, so a hung participant costs one
//! permit for at most the timeout.
//!
//! Callers wait for results on a lock and condition variable rather than
//! by entering the runtime, so a transaction may complete from inside an
//! async task of an embedding runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;

use crate::config::TransactionConfig;
use crate::error::ResourceError;

struct Slot<T> {
    result: Mutex<Option<Result<T, ResourceError>>>,
    ready: Condvar,
}

/// Write half of a [`Slot`]. Dropping it unfilled (the task panicked or
/// the runtime shut down) resolves the operation as `RM_FAILED`.
struct Completion<T> {
    slot: Arc<Slot<T>>,
    filled: bool,
}

impl<T> Completion<T> {
    fn fill(&mut self, result: Result<T, ResourceError>) {
        if self.filled {
            return;
        }
        self.filled = true;
        *self.slot.result.lock() = Some(result);
        self.slot.ready.notify_all();
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.fill(Err(ResourceError::rm_failed(
            "remote operation ended without a result",
        )));
    }
}

/// Result of a dispatched operation.
pub struct PendingOp<T> {
    slot: Arc<Slot<T>>,
}

impl<T> PendingOp<T> {
    /// Blocks the calling thread until the operation finishes. A panicked
    /// or cancelled task resolves as `RM_FAILED`.
    ///
    /// # Errors
    ///
    /// Returns the operation's error.
    pub fn wait(self) -> Result<T, ResourceError> {
        let mut result = self.slot.result.lock();
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            self.slot.ready.wait(&mut result);
        }
    }
}

/// Shared executor for remote operations.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
    op_timeout: Duration,
}

impl WorkerPool {
    /// Creates a pool.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the runtime cannot start.
    pub fn new(threads: usize, max_in_flight: usize, op_timeout: Duration) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("xact-wsat")
            .enable_time()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            op_timeout,
        })
    }

    /// Creates a pool sized from configuration.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the runtime cannot start.
    pub fn from_config(config: &TransactionConfig) -> std::io::Result<Self> {
        Self::new(
            config.worker_threads,
            config.max_concurrent_operations,
            config.async_operation_timeout(),
        )
    }

    /// Dispatches `op`. A timeout or a closed pool resolves as `RM_FAILED`.
    pub fn submit<T, F>(&self, op: F) -> PendingOp<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ResourceError>> + Send + 'static,
    {
        let slot = Arc::new(Slot {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let mut completion = Completion {
            slot: Arc::clone(&slot),
            filled: false,
        };
        let permits = Arc::clone(&self.permits);
        let op_timeout = self.op_timeout;
        self.handle.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => match tokio::time::timeout(op_timeout, op).await {
                    Ok(result) => result,
                    Err(_) => Err(ResourceError::rm_failed(format!(
                        "remote operation timed out after {op_timeout:?}"
                    ))),
                },
                Err(_) => Err(ResourceError::rm_failed("worker pool closed")),
            };
            completion.fill(result);
        });
        PendingOp { slot }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Never blocks, so the pool can be dropped from async code.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
