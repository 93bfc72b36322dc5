//! Bounded worker pool and single-owner join.
//!
//! Every parallel scan task runs on tokio but holds one of the pool's permits
//! while it executes, so at most `size` scan tasks make progress at a time.
//! Tasks are recorded on a [`JoinScope`]; the first parallel group to claim the
//! scope performs the join, and nested groups only submit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{Result, ScanError};

/// Shared concurrency bound for scan tasks. Clone shares the permits.
#[derive(Debug, Clone)]
pub struct ScanPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl Default for ScanPool {
    fn default() -> Self {
        Self::new(Self::default_size())
    }
}

impl ScanPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// max(3, cores / 2).
    pub fn default_size() -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cores / 2).max(3)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Submit `task` and record it on `scope` for the owning join.
    pub fn submit<F>(&self, scope: &JoinScope, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| ScanError::Join(e.to_string()))?;
            task.await
        });
        scope.push(handle);
    }
}

/// Outstanding tasks of one top-level scan, and who joins them.
#[derive(Debug, Default)]
pub struct JoinScope {
    claimed: AtomicBool,
    submitted: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl JoinScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the join. Exactly one caller gets `true` until [`release`](Self::release).
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    /// Total tasks ever submitted to this scope.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    fn push(&self, handle: JoinHandle<Result<()>>) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn drain(&self) -> Vec<JoinHandle<Result<()>>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Wait for every task, including tasks submitted while waiting, and
    /// return each failure. A failure never stops the join.
    pub async fn join(&self) -> Vec<ScanError> {
        let mut failures = Vec::new();
        loop {
            let batch = self.drain();
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failures.push(e),
                    Err(e) => failures.push(ScanError::Join(e.to_string())),
                }
            }
        }
        failures
    }
}
