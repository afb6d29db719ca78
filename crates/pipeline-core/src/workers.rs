//! Worker-pool abstraction for the satellite-parallel stages.
//!
//! Satellites are embarrassingly parallel: the pool partitions the item
//! list across a fixed number of rayon workers, each worker runs its items
//! sequentially, and the coordinator merges the partial results. There is
//! no shared mutable state; merging happens on the calling thread only.

use rayon::prelude::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PipelineError, Result};

/// Cooperative cancellation. Workers finish the in-flight item and exit.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fixed-size worker pool over a dedicated rayon thread pool.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl WorkerPool {
    /// Build a pool with `max_workers` threads, capped at the machine's
    /// core count so oversubscription on small hosts stays bounded.
    pub fn new(max_workers: usize) -> Result<Self> {
        let workers = max_workers.clamp(1, num_cpus::get().max(1) * 2);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("orbit-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::Resource(format!("worker pool: {e}")))?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Map `f` over `items` in parallel. Items started after cancellation
    /// yield `None`; the caller decides whether that is fatal via
    /// [`WorkerPool::check_cancelled`].
    pub fn map<I, O, F>(&self, items: Vec<I>, cancel: &CancellationToken, f: F) -> Vec<O>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> O + Sync,
    {
        self.pool.install(|| {
            items
                .into_par_iter()
                .filter_map(|item| {
                    if cancel.is_cancelled() {
                        None
                    } else {
                        Some(f(item))
                    }
                })
                .collect()
        })
    }

    /// Convert a tripped token into the pipeline's cancellation error.
    pub fn check_cancelled(cancel: &CancellationToken, stage_name: &str) -> Result<()> {
        if cancel.is_cancelled() {
            Err(PipelineError::Cancelled(stage_name.to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_returns_all_results() {
        let pool = WorkerPool::new(4).unwrap();
        let cancel = CancellationToken::new();
        let mut out = pool.map((0..100).collect(), &cancel, |i: i32| i * 2);
        out.sort_unstable();
        assert_eq!(out.len(), 100);
        assert_eq!(out[0], 0);
        assert_eq!(out[99], 198);
    }

    #[test]
    fn test_cancelled_pool_reports_error() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(WorkerPool::check_cancelled(&cancel, "stage2").is_err());
    }

    #[test]
    fn test_worker_count_clamped() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.workers(), 1);
    }
}
