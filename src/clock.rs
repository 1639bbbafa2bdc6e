//! Time source for TTL and timestamp bookkeeping.
//!
//! Every component reads time through a shared [`Clock`] so expiry boundaries
//! can be exercised deterministically in tests with [`ManualClock`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A source of wall-clock time in Unix milliseconds.
pub trait Clock: Send + Sync {
    /// Current time in Unix epoch milliseconds.
    fn now_millis(&self) -> u64;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        crate::current_timestamp_millis()
    }
}

/// Manually advanced clock.
///
/// Cloning shares the underlying instant, so a test can hold one handle and
/// advance time seen by the kernel.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock frozen at the given instant.
    #[must_use]
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Creates a clock frozen at the current system time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::new(crate::current_timestamp_millis())
    }

    /// Moves the clock forward.
    pub fn advance_millis(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Moves the clock forward by whole seconds.
    pub fn advance_secs(&self, secs: u64) {
        self.advance_millis(secs.saturating_mul(1000));
    }

    /// Sets the clock to an absolute instant.
    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Shared clock handle used throughout the kernel.
pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_shared_handle() {
        let clock = ManualClock::new(1_000);
        let handle = clock.clone();
        handle.advance_secs(2);
        assert_eq!(clock.now_millis(), 3_000);
        clock.set_millis(10);
        assert_eq!(handle.now_millis(), 10);
    }

    #[test]
    fn test_system_clock_is_positive() {
        assert!(SystemClock.now_millis() > 0);
    }
}
