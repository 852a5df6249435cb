//! Shared worker pool.
//!
//! Bounded concurrency for unordered request execution and multicast
//! fan-out. Submission is non-blocking: when the pool is saturated the task
//! is rejected and logged, and the caller decides what that means.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

/// Bounded pool of concurrent tasks.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Runs the future on the pool, or rejects it when no slot is free.
    pub fn try_submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    task.await;
                    drop(permit);
                });
                true
            }
            Err(_) => {
                warn!(capacity = self.capacity, "worker pool saturated, task rejected");
                false
            }
        }
    }

    /// Free slots, for tests and diagnostics.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
