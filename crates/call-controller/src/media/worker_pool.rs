//! Media worker pool.
//!
//! Fixed-size pool created at startup. Placement picks the eligible worker
//! with the fewest routers (ties go to the lowest index) and skips workers at
//! their router cap. Counts are atomics so placement never takes a lock.
//!
//! A worker whose router creation failed is taken out of placement for a
//! retry window. Once the window has passed it is eligible again; the next
//! successful router creation on it marks it reachable, another failure
//! restarts the window.

use super::{MediaError, WorkerId};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default time an unreachable worker sits out of placement.
pub const DEFAULT_WORKER_RETRY_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct WorkerSlot {
    id: WorkerId,
    router_count: AtomicUsize,
    reachable: AtomicBool,
    /// Milliseconds since the pool epoch at which the worker was last marked unreachable.
    down_at_ms: AtomicU64,
}

/// Point-in-time load of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerLoad {
    pub worker: usize,
    pub router_count: usize,
    pub reachable: bool,
}

/// Pool of media workers with least-loaded placement.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<WorkerSlot>,
    max_routers_per_worker: usize,
    retry_after: Duration,
    epoch: Instant,
}

impl WorkerPool {
    /// Create a pool of `size` workers, each hosting at most `max_routers_per_worker` routers.
    #[must_use]
    pub fn new(size: usize, max_routers_per_worker: usize) -> Self {
        let workers = (0..size)
            .map(|i| WorkerSlot {
                id: WorkerId(i),
                router_count: AtomicUsize::new(0),
                reachable: AtomicBool::new(true),
                down_at_ms: AtomicU64::new(0),
            })
            .collect();
        Self {
            workers,
            max_routers_per_worker,
            retry_after: DEFAULT_WORKER_RETRY_AFTER,
            epoch: Instant::now(),
        }
    }

    /// Set how long an unreachable worker is left out of placement.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn is_eligible(&self, slot: &WorkerSlot, now_ms: u64) -> bool {
        if slot.reachable.load(Ordering::Acquire) {
            return true;
        }
        let down_for = now_ms.saturating_sub(slot.down_at_ms.load(Ordering::Acquire));
        u128::from(down_for) >= self.retry_after.as_millis()
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Reserve a router slot on the least-loaded eligible worker.
    ///
    /// Unreachable workers whose retry window has passed are eligible again.
    /// The returned worker's count is already incremented; callers must
    /// [`release`](Self::release) it if router creation fails.
    ///
    /// # Errors
    ///
    /// Returns `MediaError::NoWorkerAvailable` when every worker is
    /// unreachable or at capacity.
    pub fn assign(&self) -> Result<WorkerId, MediaError> {
        let now_ms = self.now_ms();
        loop {
            let candidate = self
                .workers
                .iter()
                .filter(|w| self.is_eligible(w, now_ms))
                .map(|w| (w.router_count.load(Ordering::Acquire), w))
                .filter(|(count, _)| *count < self.max_routers_per_worker)
                .min_by_key(|(count, w)| (*count, w.id));

            let Some((observed, slot)) = candidate else {
                warn!(
                    target: "cc.media.pool",
                    pool_size = self.workers.len(),
                    "No media worker available"
                );
                return Err(MediaError::NoWorkerAvailable);
            };

            // Another placement may have raced us; re-evaluate on conflict.
            if slot
                .router_count
                .compare_exchange(observed, observed + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(
                    target: "cc.media.pool",
                    worker = %slot.id,
                    router_count = observed + 1,
                    "Worker assigned"
                );
                return Ok(slot.id);
            }
        }
    }

    /// Return a router slot to `worker`.
    pub fn release(&self, worker: WorkerId) {
        if let Some(slot) = self.workers.get(worker.0) {
            let _ = slot
                .router_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    /// Exclude `worker` from placement for the retry window.
    ///
    /// Marking a worker that is already down restarts its window.
    pub fn mark_unreachable(&self, worker: WorkerId) {
        if let Some(slot) = self.workers.get(worker.0) {
            slot.down_at_ms.store(self.now_ms(), Ordering::Release);
            if slot.reachable.swap(false, Ordering::AcqRel) {
                warn!(
                    target: "cc.media.pool",
                    worker = %worker,
                    retry_after_ms = u64::try_from(self.retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Media worker marked unreachable"
                );
            }
        }
    }

    /// Make `worker` eligible for placement again.
    pub fn mark_reachable(&self, worker: WorkerId) {
        if let Some(slot) = self.workers.get(worker.0) {
            if !slot.reachable.swap(true, Ordering::AcqRel) {
                info!(
                    target: "cc.media.pool",
                    worker = %worker,
                    "Media worker reachable again"
                );
            }
        }
    }

    /// Current router count on `worker`.
    #[must_use]
    pub fn router_count(&self, worker: WorkerId) -> usize {
        self.workers
            .get(worker.0)
            .map_or(0, |w| w.router_count.load(Ordering::Acquire))
    }

    /// Snapshot of every worker's load.
    #[must_use]
    pub fn loads(&self) -> Vec<WorkerLoad> {
        self.workers
            .iter()
            .map(|w| WorkerLoad {
                worker: w.id.0,
                router_count: w.router_count.load(Ordering::Acquire),
                reachable: w.reachable.load(Ordering::Acquire),
            })
            .collect()
    }
}
