//! Bounded-concurrency gate for I/O-heavy work.
//!
//! Every unit of indexing or extraction work acquires one slot from a shared
//! [`ResourceLimiter`] before touching the disk. Slot acquisition suspends
//! when the ceiling is reached and always races the operation's cancellation
//! token, so a cancelled operation never sits in the queue. Jobs are named so
//! that in-flight work can be inspected, and monotone done/total counters
//! feed progress callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::VfsError;

/// Progress callback: (completed units, total units).
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A bounded pool of concurrency slots with named jobs.
pub struct ResourceLimiter {
    name: String,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    next_job_id: AtomicU64,
    done: AtomicU64,
    total: AtomicU64,
    active: Mutex<HashMap<u64, String>>,
}

impl ResourceLimiter {
    /// Create a limiter with `capacity` concurrent slots.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
            next_job_id: AtomicU64::new(0),
            done: AtomicU64::new(0),
            total: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire one slot, suspending until one is free or `cancel` fires.
    ///
    /// The returned [`Job`] releases the slot and retires its name on drop.
    pub async fn begin_job(
        self: &Arc<Self>,
        job_name: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<Job, VfsError> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(VfsError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|e| VfsError::Other(Box::new(e)))?
            }
        };

        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let name = job_name.into();
        self.active.lock().insert(id, name);
        Ok(Job {
            limiter: Arc::clone(self),
            id,
            _permit: permit,
        })
    }

    /// Declare how many units of work the current operation will process.
    /// Adds to the running total so overlapping operations aggregate.
    pub fn add_to_total(&self, units: u64) {
        self.total.fetch_add(units, Ordering::Relaxed);
    }

    /// Snapshot of (done, total) counters.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.done.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// Names of all jobs currently holding a slot.
    pub fn active_jobs(&self) -> Vec<String> {
        self.active.lock().values().cloned().collect()
    }

    fn retire(&self, id: u64) {
        self.active.lock().remove(&id);
    }
}

/// RAII guard for one acquired slot.
pub struct Job {
    limiter: Arc<ResourceLimiter>,
    id: u64,
    _permit: OwnedSemaphorePermit,
}

impl Job {
    /// Mark one unit of work complete and report (done, total) to `progress`.
    pub fn report_done(&self, progress: Option<&ProgressFn>) {
        let done = self.limiter.done.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.limiter.total.load(Ordering::Relaxed);
        if let Some(cb) = progress {
            (**cb)(done, total);
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.limiter.retire(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn ceiling_is_enforced() {
        let limiter = Arc::new(ResourceLimiter::new("test", 2));
        let cancel = CancellationToken::new();
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                let _job = limiter.begin_job(format!("job-{i}"), &cancel).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_promptly() {
        let limiter = Arc::new(ResourceLimiter::new("test", 1));
        let cancel = CancellationToken::new();

        // Hold the only slot.
        let held = limiter.begin_job("holder", &cancel).await.unwrap();
        assert_eq!(limiter.active_jobs(), vec!["holder".to_string()]);

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.begin_job("waiter", &cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(VfsError::Cancelled)));
        drop(held);
        assert!(limiter.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn progress_counters_accumulate() {
        let limiter = Arc::new(ResourceLimiter::new("test", 4));
        let cancel = CancellationToken::new();
        limiter.add_to_total(3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |done, total| {
            seen_cb.lock().push((done, total));
        });

        for i in 0..3 {
            let job = limiter.begin_job(format!("unit-{i}"), &cancel).await.unwrap();
            job.report_done(Some(&progress));
        }

        assert_eq!(limiter.progress(), (3, 3));
        assert_eq!(seen.lock().last().copied(), Some((3, 3)));
    }
}
