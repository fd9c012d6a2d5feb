//! Bounded pool for deferred server work.
//!
//! Connections ask their server to deregister them from inside `shutdown`,
//! which may run on the connection's own session task. The request is queued
//! here instead of running inline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

#[derive(Debug)]
pub struct WorkerPool {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

impl WorkerPool {
    /// Pool running at most `size` jobs at once on the current runtime.
    pub fn new(size: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(size.max(1))),
            runtime: Handle::current(),
        }
    }

    /// Queue a job. Never blocks the caller.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        self.tracker.spawn_on(
            async move {
                // Closed semaphore means the pool is gone; drop the job.
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                job.await;
            },
            &self.runtime,
        );
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `timeout` for every queued job. Returns `false` on timeout.
    ///
    /// Jobs submitted after `drain` starts are still tracked.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                pending = self.tracker.len(),
                timeout_ms = timeout.as_millis() as u64,
                "Worker pool drain timed out"
            );
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn drain_waits_for_submitted_jobs() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = done.clone();
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn drain_times_out_on_stuck_job() {
        let pool = WorkerPool::new(1);
        pool.submit(std::future::pending());
        assert!(!pool.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pool_size_bounds_concurrency() {
        let pool = WorkerPool::new(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
