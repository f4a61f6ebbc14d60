// SPDX-License-Identifier: MPL-2.0

//! The engine: a fixed pool of decoder workers and the clip-to-worker
//! assignment policy.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};

use rand::Rng;
use tracing::{error, info};

use crate::{
    config::EngineConfig,
    types::{ClipId, Clock},
    worker::WorkerHandle,
};

/// Owner of the worker pool.
///
/// Construct one at application start-up and pass it to
/// [`Clip::new`](crate::Clip::new). The first few clips each start a fresh
/// worker; once the pool is full, new clips go to the worker with the lowest
/// load level. Workers are never rebalanced after assignment.
///
/// [`Engine::shutdown`] (also run on drop) interrupts every worker, joins its
/// thread and destroys the remaining backends. One engine failing a clip
/// never disturbs its peers; the engine as a whole never fails.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<Clock>,
    workers: RwLock<Vec<Arc<WorkerHandle>>>,
    next_clip_id: AtomicU64,
    down: AtomicBool,
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(mut config: EngineConfig) -> Self {
        config.workers = config.workers.max(1);
        Self {
            config,
            clock: Arc::new(Clock::new()),
            workers: RwLock::new(Vec::new()),
            next_clip_id: AtomicU64::new(0),
            down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Milliseconds on the engine's monotonic clock. Pass this to
    /// [`Clip::current`](crate::Clip::current) when painting.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn next_clip_id(&self) -> ClipId {
        ClipId(self.next_clip_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Pick a worker for a new clip, starting fresh workers until the pool
    /// is full. Returns `None` only after shutdown or if no worker could be
    /// spawned at all.
    pub(crate) fn assign_worker(&self) -> Option<(usize, Arc<WorkerHandle>)> {
        if self.down.load(Ordering::Acquire) {
            return None;
        }

        {
            let workers = self.read_workers();
            if workers.len() >= self.config.workers {
                return pick_least_loaded(&workers);
            }
        }

        let mut workers = self.write_workers();
        if workers.len() < self.config.workers {
            let index = workers.len();
            match WorkerHandle::spawn(index, self.clock.clone(), &self.config) {
                Ok(worker) => {
                    info!(worker = index, "started clip worker");
                    let worker = Arc::new(worker);
                    workers.push(worker.clone());
                    return Some((index, worker));
                }
                Err(err) => {
                    error!(worker = index, ?err, "failed to start clip worker");
                }
            }
        }
        pick_least_loaded(&workers)
    }

    /// Quit every worker's loop and join its thread.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers: Vec<_> = self.read_workers().clone();
        for worker in &workers {
            worker.quit_and_join();
        }
        info!(workers = workers.len(), "clip engine shut down");
    }

    fn read_workers(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<WorkerHandle>>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_workers(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<WorkerHandle>>> {
        self.workers.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn worker_loads(&self) -> Vec<i64> {
        self.read_workers()
            .iter()
            .map(|worker| worker.load_level.load(Ordering::Relaxed))
            .collect()
    }
}

/// Least-loaded worker, ties broken by a random starting index so
/// simultaneous bursts do not pile onto one worker.
fn pick_least_loaded(workers: &[Arc<WorkerHandle>]) -> Option<(usize, Arc<WorkerHandle>)> {
    if workers.is_empty() {
        return None;
    }
    let start = rand::thread_rng().gen_range(0..workers.len());
    let mut best = start;
    let mut best_level = i64::MAX;
    for offset in 0..workers.len() {
        let index = (start + offset) % workers.len();
        let level = workers[index].load_level.load(Ordering::Relaxed);
        if level < best_level {
            best = index;
            best_level = level;
        }
    }
    Some((best, workers[best].clone()))
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
