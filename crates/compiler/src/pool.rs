//! Fixed-size worker pool.

use anyhow::{Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Idle,
    Running,
    /// A stop or the target was observed; workers finish their current item.
    Draining,
    Stopped,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PoolState::Running,
            2 => PoolState::Draining,
            3 => PoolState::Stopped,
            _ => PoolState::Idle,
        }
    }
}

/// Runs one long-lived loop per worker on a dedicated rayon pool and
/// returns once every loop has exited.
pub struct WorkerPool {
    pool: ThreadPool,
    workers: usize,
    state: AtomicU8,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("kernelvault-worker-{index}"))
            .build()
            .context("failed to build worker pool")?;
        Ok(Self {
            pool,
            workers,
            state: AtomicU8::new(PoolState::Idle as u8),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Mark the pool as draining. Only the first call after `run` starts has
    /// an effect; returns whether this call made the transition.
    pub fn begin_draining(&self) -> bool {
        self.state
            .compare_exchange(
                PoolState::Running as u8,
                PoolState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Run `job(worker_index)` on every worker and block until all return.
    pub fn run<F>(&self, job: F)
    where
        F: Fn(usize) + Sync,
    {
        self.state.store(PoolState::Running as u8, Ordering::SeqCst);
        let job = &job;
        self.pool.scope(|scope| {
            for worker in 0..self.workers {
                scope.spawn(move |_| job(worker));
            }
        });
        self.state.store(PoolState::Stopped as u8, Ordering::SeqCst);
    }
}
