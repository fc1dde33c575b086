//! Throughput estimation feeding the representation selector.

/// Source of the bandwidth figure the selector works from. Implemented by the
/// built-in EWMA estimator; tests substitute fixed values.
pub trait BandwidthEstimator: Send {
    /// Records one completed transfer.
    fn record(&mut self, bytes: usize, duration_s: f64);

    /// Current estimate in bits per second.
    fn estimate_bps(&self) -> f64;
}

/// Exponentially weighted moving average over per-transfer throughput
/// samples. Before the first sample an optimistic 50 Mb/s prior is returned
/// so startup picks a mid-ladder representation instead of the floor.
pub struct EwmaEstimator {
    ewma: f64,
    initialized: bool,
    alpha: f64,
}

impl EwmaEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            ewma: 0.0,
            initialized: false,
            alpha,
        }
    }
}

impl Default for EwmaEstimator {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl BandwidthEstimator for EwmaEstimator {
    fn record(&mut self, bytes: usize, duration_s: f64) {
        if duration_s <= 0.0 {
            return;
        }
        let sample = (bytes as f64 * 8.0) / duration_s;
        self.ewma = if self.initialized {
            self.alpha * sample + (1.0 - self.alpha) * self.ewma
        } else {
            self.initialized = true;
            sample
        };
    }

    fn estimate_bps(&self) -> f64 {
        if self.initialized {
            self.ewma
        } else {
            50_000_000.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prior_before_first_sample() {
        let est = EwmaEstimator::default();
        assert_eq!(est.estimate_bps(), 50_000_000.0);
    }

    #[test]
    fn first_sample_replaces_prior_entirely() {
        let mut est = EwmaEstimator::new(0.3);
        est.record(1_000_000, 1.0); // 8 Mb/s
        assert_eq!(est.estimate_bps(), 8_000_000.0);
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut est = EwmaEstimator::new(0.5);
        est.record(1_000_000, 1.0); // 8 Mb/s
        est.record(2_000_000, 1.0); // 16 Mb/s
        assert_eq!(est.estimate_bps(), 12_000_000.0);
    }

    #[test]
    fn zero_duration_sample_ignored() {
        let mut est = EwmaEstimator::new(0.3);
        est.record(1_000_000, 0.0);
        assert_eq!(est.estimate_bps(), 50_000_000.0);
    }
}
