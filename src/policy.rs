//! Roll threshold policy.
//!
//! Pure decision logic: no side effects, no state beyond the two configured
//! thresholds. The partition writer and the flush scheduler both funnel
//! through `should_roll`.

use std::time::{Duration, Instant};

/// Size/time thresholds supplied at writer construction.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdPolicy {
    max_bytes: u64,
    max_open: Duration,
}

impl ThresholdPolicy {
    pub fn new(max_bytes: u64, max_open: Duration) -> Self {
        Self {
            max_bytes,
            max_open,
        }
    }

    /// Decide whether the current artifact should roll.
    ///
    /// True once accumulated bytes reach the size threshold or the artifact
    /// has been open for the time threshold. An empty artifact never rolls:
    /// empty batches are never submitted.
    pub fn should_roll(&self, raw_bytes: u64, opened_at: Instant, now: Instant) -> bool {
        if raw_bytes == 0 {
            return false;
        }
        raw_bytes >= self.max_bytes || now.duration_since(opened_at) >= self.max_open
    }
}
