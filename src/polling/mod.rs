//! Adaptive polling for queue consumers.
//!
//! Each subscription owns a [`QueuePollingOptimizer`]. Workers poll the store
//! at the current interval; every empty poll stretches the interval by the
//! configured factor up to a ceiling, and every successful claim (or wake
//! signal from the change notifier) snaps it back to the base interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

/// Per-subscription polling interval state. All counters use atomic updates;
/// the optimizer is shared by every worker of a subscription.
pub struct QueuePollingOptimizer {
    base_interval_micros: u64,
    max_interval_micros: u64,
    increment_factor: f64,
    current_interval_micros: AtomicU64,
    wake: Notify,
}

impl QueuePollingOptimizer {
    /// Create an optimizer with the given base interval, stretch factor and
    /// ceiling.
    pub fn new(base_interval: Duration, increment_factor: f64, max_interval: Duration) -> Self {
        let base_interval_micros = base_interval.as_micros() as u64;
        Self {
            base_interval_micros,
            max_interval_micros: (max_interval.as_micros() as u64).max(base_interval_micros),
            increment_factor,
            current_interval_micros: AtomicU64::new(base_interval_micros),
            wake: Notify::new(),
        }
    }

    /// The interval a worker should sleep before its next poll.
    pub fn current_interval(&self) -> Duration {
        Duration::from_micros(self.current_interval_micros.load(Ordering::Relaxed))
    }

    /// Record a successful claim: reset the interval to its base value.
    pub fn register_hit(&self) {
        self.current_interval_micros
            .store(self.base_interval_micros, Ordering::Relaxed);
    }

    /// Record an empty poll: stretch the interval and return the new value.
    pub fn register_miss(&self) -> Duration {
        let current = self.current_interval_micros.load(Ordering::Relaxed);
        let stretched =
            ((current as f64 * self.increment_factor) as u64).min(self.max_interval_micros);
        self.current_interval_micros
            .store(stretched, Ordering::Relaxed);
        trace!(interval_micros = stretched, "Stretched polling interval");
        Duration::from_micros(stretched)
    }

    /// Wake sleeping workers and reset the interval to its base value.
    ///
    /// Called when a new message lands on the queue so idle workers poll
    /// immediately instead of sleeping out a stretched interval.
    pub fn wake(&self) {
        self.current_interval_micros
            .store(self.base_interval_micros, Ordering::Relaxed);
        self.wake.notify_waiters();
    }

    /// Wait for the next wake signal.
    pub async fn awoken(&self) {
        self.wake.notified().await;
    }
}
