use std::time::Duration;

const RING_SLOTS: usize = 32;
/// Smoothing weight on the previous estimate.
const ALPHA: f64 = 0.5;

/// Smoothed average of recent end-to-end queue waits in one partition.
/// Reported to clients via the info endpoint; never used for admission.
#[derive(Debug, Clone)]
pub struct WaitEstimator {
    ring: [u64; RING_SLOTS],
    filled: usize,
    next: usize,
    smoothed_ms: f64,
}

impl WaitEstimator {
    pub fn new() -> Self {
        Self {
            ring: [0; RING_SLOTS],
            filled: 0,
            next: 0,
            smoothed_ms: 0.0,
        }
    }

    pub fn record(&mut self, wait: Duration) {
        self.ring[self.next] = wait.as_millis() as u64;
        self.next = (self.next + 1) % RING_SLOTS;
        self.filled = (self.filled + 1).min(RING_SLOTS);

        let sum: u64 = self.ring[..self.filled].iter().sum();
        let mean = sum as f64 / self.filled as f64;
        self.smoothed_ms = if self.filled == 1 {
            mean
        } else {
            ALPHA * self.smoothed_ms + (1.0 - ALPHA) * mean
        };
    }

    pub fn estimate(&self) -> Duration {
        Duration::from_millis(self.smoothed_ms.round() as u64)
    }
}

impl Default for WaitEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_estimator_reports_zero() {
        assert_eq!(WaitEstimator::new().estimate(), Duration::ZERO);
    }

    #[test]
    fn estimate_tracks_recorded_waits() {
        let mut estimator = WaitEstimator::new();
        for _ in 0..8 {
            estimator.record(Duration::from_millis(100));
        }
        let estimate = estimator.estimate().as_millis();
        assert!((90..=110).contains(&estimate), "estimate was {estimate}ms");
    }

    #[test]
    fn ring_forgets_old_samples() {
        let mut estimator = WaitEstimator::new();
        estimator.record(Duration::from_secs(60));
        for _ in 0..RING_SLOTS {
            estimator.record(Duration::from_millis(10));
        }
        assert!(estimator.estimate() < Duration::from_secs(1));
    }
}
