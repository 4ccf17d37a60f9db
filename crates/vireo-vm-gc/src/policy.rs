//! Adaptive collection policy
//!
//! Watches the GC-overhead ratio (collection time / total time) over a
//! sliding window of recent collections and nudges the trigger thresholds:
//! above 10% overhead the thresholds rise (collect later, larger heaps);
//! below 2% they fall (collect earlier, tighter heaps). The heap clamps the
//! resulting thresholds to [0.5, 0.95].

use std::collections::VecDeque;
use std::time::Duration;

/// Number of recent collections considered by the policy
const WINDOW: usize = 16;

/// Overhead above which thresholds are raised
const HIGH_OVERHEAD: f64 = 0.10;

/// Overhead below which thresholds are lowered
const LOW_OVERHEAD: f64 = 0.02;

/// Sliding-window overhead controller
#[derive(Debug, Default)]
pub struct AdaptivePolicy {
    window: VecDeque<(Duration, Duration)>,
}

impl AdaptivePolicy {
    /// Create a policy with an empty window
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one collection: its pause and the mutator time since the
    /// previous collection. Returns a multiplicative threshold adjustment,
    /// or `None` when the overhead is in the acceptable band.
    pub fn on_collection(&mut self, gc_time: Duration, mutator_time: Duration) -> Option<f64> {
        self.window.push_back((gc_time, mutator_time));
        if self.window.len() > WINDOW {
            self.window.pop_front();
        }

        let ratio = self.overhead_ratio()?;
        if ratio > HIGH_OVERHEAD {
            Some(1.05)
        } else if ratio < LOW_OVERHEAD {
            Some(0.95)
        } else {
            None
        }
    }

    /// Current GC-overhead ratio over the window
    pub fn overhead_ratio(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let gc: f64 = self.window.iter().map(|(g, _)| g.as_secs_f64()).sum();
        let total: f64 = self
            .window
            .iter()
            .map(|(g, m)| g.as_secs_f64() + m.as_secs_f64())
            .sum();
        if total <= 0.0 {
            return None;
        }
        Some(gc / total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_overhead_raises() {
        let mut policy = AdaptivePolicy::new();
        // 50% overhead: 10ms GC per 10ms mutator
        let adjust = policy.on_collection(
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        assert_eq!(adjust, Some(1.05));
    }

    #[test]
    fn test_low_overhead_lowers() {
        let mut policy = AdaptivePolicy::new();
        // 0.1% overhead
        let adjust = policy.on_collection(
            Duration::from_micros(10),
            Duration::from_millis(10),
        );
        assert_eq!(adjust, Some(0.95));
    }

    #[test]
    fn test_acceptable_band_holds() {
        let mut policy = AdaptivePolicy::new();
        // 5% overhead sits inside [2%, 10%]
        let adjust = policy.on_collection(
            Duration::from_millis(5),
            Duration::from_millis(95),
        );
        assert_eq!(adjust, None);
    }

    #[test]
    fn test_window_bounded() {
        let mut policy = AdaptivePolicy::new();
        for _ in 0..100 {
            policy.on_collection(Duration::from_millis(1), Duration::from_millis(99));
        }
        assert!(policy.window.len() <= WINDOW);
    }
}
