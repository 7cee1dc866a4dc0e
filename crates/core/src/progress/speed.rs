//! Transfer rate estimation over a sliding window of samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples closer together than this do not produce a rate.
const MIN_SPAN: Duration = Duration::from_millis(100);

/// Ring buffer of `(time, bytes)` samples.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    samples: VecDeque<(Instant, u64)>,
    capacity: usize,
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(16)
    }
}

impl SpeedTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
        }
    }

    /// Adds a sample and returns the average rate across the window.
    pub fn record(&mut self, bytes: u64, at: Instant) -> Option<f64> {
        if let Some(&(_, last)) = self.samples.back() {
            // A counter going backwards means a new unit of work began.
            if bytes < last {
                self.samples.clear();
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, bytes));
        self.rate()
    }

    /// Average bytes per second across the window.
    pub fn rate(&self) -> Option<f64> {
        let (first_at, first_bytes) = *self.samples.front()?;
        let (last_at, last_bytes) = *self.samples.back()?;
        let span = last_at.checked_duration_since(first_at)?;
        if span < MIN_SPAN {
            return None;
        }
        Some(last_bytes.saturating_sub(first_bytes) as f64 / span.as_secs_f64())
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_over_window() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new(4);
        assert!(tracker.record(0, start).is_none());
        let rate = tracker
            .record(1_000, start + Duration::from_millis(500))
            .unwrap();
        assert!((rate - 2_000.0).abs() < 1.0);
    }

    #[test]
    fn test_window_drops_old_samples() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::new(2);
        tracker.record(0, start);
        tracker.record(10_000, start + Duration::from_secs(1));
        // Only the last two samples count: 0 bytes over one second.
        let rate = tracker
            .record(10_000, start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn test_counter_reset_clears_window() {
        let start = Instant::now();
        let mut tracker = SpeedTracker::default();
        tracker.record(5_000, start);
        tracker.record(9_000, start + Duration::from_secs(1));
        assert!(tracker.record(100, start + Duration::from_secs(2)).is_none());
    }
}
