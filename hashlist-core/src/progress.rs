//! Progress tracking utilities
//!
//! Thread-safe counter that logs a message every time the count crosses a
//! multiple of the configured interval.

use log::info;
use std::sync::atomic::{AtomicU64, Ordering};

/// Logs progress at regular record intervals.
///
/// # Example
/// ```
/// use hashlist_core::ProgressTracker;
///
/// let tracker = ProgressTracker::new("records merged").with_interval(100);
/// for _ in 0..250 {
///     tracker.log_if_needed(1); // logs at 100 and 200
/// }
/// tracker.log_final(); // logs "records merged 250 (complete)"
/// ```
#[derive(Debug)]
pub struct ProgressTracker {
    interval: u64,
    message: String,
    count: AtomicU64,
}

impl ProgressTracker {
    /// Creates a tracker with a default interval of 10,000
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { interval: 10_000, message: message.into(), count: AtomicU64::new(0) }
    }

    /// Sets the interval; zero is treated as one
    #[must_use]
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Adds `additional` to the count and logs each interval boundary crossed.
    ///
    /// Returns true if the new count is an exact multiple of the interval.
    pub fn log_if_needed(&self, additional: u64) -> bool {
        let prev = self.count.fetch_add(additional, Ordering::Relaxed);
        let new_count = prev + additional;

        for i in (prev / self.interval + 1)..=(new_count / self.interval) {
            info!("{} {}", self.message, i * self.interval);
        }

        new_count > 0 && new_count % self.interval == 0
    }

    /// Logs the final count unless it was just logged at a boundary
    pub fn log_final(&self) {
        let count = self.count();
        if count == 0 || count % self.interval != 0 {
            info!("{} {} (complete)", self.message, count);
        }
    }

    /// Current count
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
