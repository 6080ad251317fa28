//! Per-call gas delta computation.
//!
//! The engine reports cumulative gas per instance; the billing layer wants
//! per-call deltas. [`GasTracker`] keeps the last observed reading, and the
//! handle forwards each delta to the metering callback together with the
//! export name that consumed it.

use serde::{Deserialize, Serialize};

/// Metering callback receiving `(delta, export_wire_name)` after every
/// successful guest call
pub type MeterFn = Box<dyn FnMut(u64, &str) + Send>;

/// Cumulative-to-delta gas bookkeeping for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GasTracker {
    last: u64,
}

impl GasTracker {
    /// Create a tracker with a zero baseline
    #[must_use]
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Last observed cumulative reading
    #[must_use]
    pub fn last_gas(&self) -> u64 {
        self.last
    }

    /// Record a new cumulative reading and return the delta since the
    /// previous one.
    ///
    /// Cumulative gas is non-decreasing per instance; a reading below the
    /// baseline would indicate an engine fault, so the delta saturates at 0
    /// rather than wrapping.
    pub fn observe(&mut self, cumulative: u64) -> u64 {
        let delta = cumulative.saturating_sub(self.last);
        self.last = cumulative;
        delta
    }

    /// Reset the baseline to 0.
    ///
    /// Done on every translated error and at disposal so the next
    /// successful call reports from a clean baseline rather than a stale
    /// one.
    pub fn reset(&mut self) {
        self.last = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_is_full_delta() {
        let mut tracker = GasTracker::new();
        assert_eq!(tracker.observe(1500), 1500);
        assert_eq!(tracker.last_gas(), 1500);
    }

    #[test]
    fn test_consecutive_deltas() {
        let mut tracker = GasTracker::new();
        tracker.observe(1000);
        assert_eq!(tracker.observe(1600), 600);
        assert_eq!(tracker.observe(1600), 0);
        assert_eq!(tracker.observe(2100), 500);
    }

    #[test]
    fn test_reset_restores_clean_baseline() {
        let mut tracker = GasTracker::new();
        tracker.observe(5000);
        tracker.reset();
        assert_eq!(tracker.last_gas(), 0);
        assert_eq!(tracker.observe(700), 700);
    }

    #[test]
    fn test_regressing_reading_saturates() {
        let mut tracker = GasTracker::new();
        tracker.observe(1000);
        assert_eq!(tracker.observe(400), 0);
        assert_eq!(tracker.last_gas(), 400);
    }
}
