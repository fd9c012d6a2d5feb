//! Per-connection inactivity timer.
//!
//! Ticks once a second. Every tick adds one to the elapsed counter; when the
//! counter reaches the TTL the expiry callback runs once and the timer stops.
//! Any inbound traffic calls [`Watchdog::reset`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::observability::metrics;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct TimerTask {
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

#[derive(Debug)]
pub struct Watchdog {
    ttl_secs: u64,
    elapsed: Arc<AtomicU64>,
    timer: Mutex<TimerTask>,
}

impl Watchdog {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl_secs,
            elapsed: Arc::new(AtomicU64::new(0)),
            timer: Mutex::new(TimerTask::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerTask> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start ticking on the current runtime.
    ///
    /// No-op if already running or already stopped.
    pub fn launch<F>(&self, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut timer = self.lock();
        if timer.stopped || timer.task.is_some() {
            return;
        }

        let ttl = self.ttl_secs;
        let elapsed = self.elapsed.clone();
        timer.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + TICK, TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let seconds = elapsed.fetch_add(1, Ordering::AcqRel) + 1;
                if seconds >= ttl {
                    tracing::warn!(ttl_secs = ttl, "Peer silent past time to live");
                    metrics::record_watchdog_expired();
                    on_expire();
                    break;
                }
            }
        }));
    }

    /// Clear the elapsed counter.
    pub fn reset(&self) {
        self.elapsed.store(0, Ordering::Release);
    }

    /// Seconds since the last reset, as counted by the ticker.
    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed.load(Ordering::Acquire)
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Stop the timer for good. Idempotent.
    pub fn stop(&self) {
        let mut timer = self.lock();
        timer.stopped = true;
        if let Some(task) = timer.task.take() {
            task.abort();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
