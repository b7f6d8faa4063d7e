use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// A recurring background task that prunes stale connections.
///
/// Runs on its own timer task, independent of request-handling tasks. The
/// interval is adjustable at runtime; the scheduler is started at server
/// construction and stopped exactly once, as the first step of shutdown.
pub struct MaintenanceScheduler {
    interval_ms: Arc<AtomicU64>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl MaintenanceScheduler {
    /// Starts the scheduler with the given interval. `tick` performs one
    /// maintenance pass and returns `false` to stop the scheduler (the
    /// owning server has gone away). Errors inside the pass must be caught
    /// by `tick` itself; they never kill the timer task.
    pub fn start<F, Fut>(interval_ms: u64, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let interval = Arc::new(AtomicU64::new(interval_ms));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_interval = interval.clone();
        tokio::spawn(async move {
            loop {
                let sleep_ms = task_interval.load(Ordering::SeqCst).max(1);
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                        if !tick().await {
                            break;
                        }
                    }
                }
            }
            debug!("Connection maintenance scheduler stopped");
        });

        Self {
            interval_ms: interval,
            stop_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// The current maintenance interval in milliseconds.
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::SeqCst)
    }

    /// Adjusts the maintenance interval. Takes effect from the next tick.
    pub fn set_interval_ms(&self, interval_ms: u64) {
        self.interval_ms.store(interval_ms, Ordering::SeqCst);
    }

    /// Stops the scheduler. Subsequent calls are no-ops.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
        }
    }

    /// Whether [`MaintenanceScheduler::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = ticks.clone();
        let scheduler = MaintenanceScheduler::start(5, move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least two ticks, saw {seen}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        // at most one tick may have been in flight when stop was called
        assert!(ticks.load(Ordering::SeqCst) <= seen + 1);
        assert!(scheduler.is_stopped());
    }

    #[tokio::test]
    async fn tick_returning_false_stops_the_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = ticks.clone();
        let scheduler = MaintenanceScheduler::start(5, move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                false
            }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_stopped());
    }
}
