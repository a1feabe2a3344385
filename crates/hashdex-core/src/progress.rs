//! Cancellable progress scope shared by the workers of one scan or export.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::ThreadPool;

use crate::errors::{IndexError, IndexResult};

/// Cooperative cancellation flag plus a processed-files counter.
///
/// Cloning is cheap; every clone observes the same state.
#[derive(Clone, Debug, Default)]
pub struct ProgressScope {
    inner: Arc<ProgressState>,
}

#[derive(Debug, Default)]
struct ProgressState {
    cancelled: AtomicBool,
    processed: AtomicUsize,
}

impl ProgressScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Record one finished file.
    pub fn advance(&self) {
        self.inner.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> usize {
        self.inner.processed.load(Ordering::Relaxed)
    }
}

/// Marker returned by per-file closures to stop a parallel loop early.
#[derive(Debug)]
pub(crate) enum Stop {
    Cancelled,
    Failed(IndexError),
}

impl From<IndexError> for Stop {
    fn from(err: IndexError) -> Self {
        Stop::Failed(err)
    }
}

/// Build a bounded worker pool.
pub(crate) fn worker_pool(workers: usize) -> IndexResult<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("hashdex-worker-{i}"))
        .build()
        .map_err(|e| IndexError::Index(format!("failed to start worker pool: {e}")))
}
