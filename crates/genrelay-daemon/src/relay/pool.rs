//! Semaphore-bounded, supervised pool of generation workers.
//!
//! The [`WorkerPool`] limits how many generations run at once. Permits are
//! taken without waiting so a full pool rejects submissions instead of
//! queueing them. Every worker runs under a supervisor task that reports a
//! panic instead of losing it, and a `TaskTracker` lets shutdown wait for
//! all workers to drain.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Default maximum number of concurrent generations.
const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// A permit granting the right to run one generation.
///
/// When dropped, the permit is automatically returned to the pool.
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bounded pool of background generations.
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Create a new pool with the given concurrency limit.
    pub fn new(max_concurrency: usize) -> Self {
        let limit = if max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            max_concurrency
        };

        info!(max_concurrency = limit, "WorkerPool created");

        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrency: limit,
            tracker: TaskTracker::new(),
        }
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> Result<PoolPermit, PoolError> {
        if self.tracker.is_closed() {
            return Err(PoolError::Closed);
        }
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| PoolError::Exhausted {
                max: self.max_concurrency,
            })?;
        Ok(PoolPermit { _permit: permit })
    }

    /// Run `work` in the background, holding `permit` until it finishes.
    ///
    /// If `work` panics, `on_panic` runs with the panic message.
    pub fn spawn<W, P, F>(&self, permit: PoolPermit, name: String, work: W, on_panic: P)
    where
        W: Future<Output = ()> + Send + 'static,
        P: FnOnce(String) -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let worker = tokio::spawn(work);
        self.tracker.spawn(async move {
            let _permit = permit;
            match worker.await {
                Ok(()) => debug!(worker = %name, "Worker finished"),
                Err(e) => {
                    let reason = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        "worker cancelled".to_string()
                    };
                    error!(worker = %name, %reason, "Worker failed");
                    on_panic(reason).await;
                }
            }
        });
    }

    /// Refuse new work and wait for every running worker to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        info!(running = self.tracker.len(), "Waiting for workers to drain");
        self.tracker.wait().await;
    }

    /// Maximum concurrency limit.
    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of generations currently holding a permit.
    pub fn active_count(&self) -> usize {
        self.max_concurrency - self.semaphore.available_permits()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is full ({max} running)")]
    Exhausted { max: usize },

    /// The pool is shutting down.
    #[error("Worker pool has been closed")]
    Closed,
}
