//! Fixed-capacity worker pool with saturation checks and draining shutdown.
//!
//! Slots are semaphore permits. `submit` claims a slot synchronously when one
//! is free; in the narrow race where the dispatch loop saw a free slot that a
//! concurrent caller then took, the task waits for the next slot instead of
//! failing. The pool never queues work on its own initiative: callers check
//! [`WorkerPool::is_saturated`] first and answer with an overload reply.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Point-in-time occupancy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active_workers: usize,
    pub total_capacity: usize,
}

pub struct WorkerPool {
    name: String,
    slots: Arc<Semaphore>,
    capacity: usize,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Create a pool with `capacity` slots (clamped to at least one).
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            tracker: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when every slot is occupied.
    pub fn is_saturated(&self) -> bool {
        self.slots.available_permits() == 0
    }

    pub fn active_count(&self) -> usize {
        self.capacity
            .saturating_sub(self.slots.available_permits())
    }

    pub fn total_capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_workers: self.active_count(),
            total_capacity: self.capacity,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Run `task` on a pool slot. Never blocks the caller.
    ///
    /// Returns `false` if the pool has been shut down and the task was dropped.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            tracing::warn!(pool = %self.name, "Worker pool is shut down; dropping task");
            return false;
        }

        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => {
                self.tracker.spawn(async move {
                    let _permit = permit;
                    task.await;
                });
            }
            Err(_) => {
                tracing::debug!(pool = %self.name, "No free slot at submit; task waits for one");
                let slots = Arc::clone(&self.slots);
                self.tracker.spawn(async move {
                    let Ok(_permit) = slots.acquire_owned().await else {
                        return;
                    };
                    task.await;
                });
            }
        }
        true
    }

    /// Stop accepting work. With `drain`, wait for every in-flight task.
    pub async fn shutdown(&self, drain: bool) {
        self.tracker.close();
        if drain {
            tracing::info!(
                pool = %self.name,
                active = self.active_count(),
                "Draining worker pool"
            );
            self.tracker.wait().await;
        }
    }
}
