//! # Load Estimation
//!
//! Converts a stream of delay samples (milliseconds) into a load score used
//! for admission control. The score is the number of standard deviations the
//! fast running average sits above the long-term mean:
//!
//! | Load | Meaning |
//! |------|---------|
//! | `0.0` | running average at or below the mean |
//! | `N` | running average N standard deviations above the mean |
//! | [`LOAD_SATURATED`] | a pathological sample was observed |
//!
//! The estimator is not synchronized; the dispatch actor is its only writer.

/// Samples above this value (ms) saturate the load instead of being folded in.
pub const MAX_SAMPLE: u64 = 64 * 1024;

/// Load reported after a sample above [`MAX_SAMPLE`].
pub const LOAD_SATURATED: f64 = 100.0;

/// Variance floor used when rounding drives the estimate to zero or below.
const MIN_VARIANCE: f64 = 0.01;

/// Weight of the previous running average (`avg = (avg * 7 + sample) / 8`).
const RUNAVG_WEIGHT: f64 = 7.0;

/// Running load statistic over delay samples.
#[derive(Clone, Debug, Default)]
pub struct LoadValue {
    cumulative_delay: u64,
    cumulative_squared_delay: u64,
    sample_count: u64,
    runavg_delay: f64,
    load: f64,
}

impl LoadValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a new delay sample (ms) into the statistic.
    pub fn update(&mut self, sample: u64) {
        if sample > MAX_SAMPLE {
            self.load = LOAD_SATURATED;
            return;
        }
        self.cumulative_delay = self.cumulative_delay.saturating_add(sample);
        self.cumulative_squared_delay = self
            .cumulative_squared_delay
            .saturating_add(sample.saturating_mul(sample));
        self.sample_count += 1;
        self.runavg_delay = (self.runavg_delay * RUNAVG_WEIGHT + sample as f64) / (RUNAVG_WEIGHT + 1.0);
        self.recalculate();
    }

    fn recalculate(&mut self) {
        if self.sample_count <= 1 {
            return;
        }
        let n = self.sample_count as f64;
        let sum = self.cumulative_delay as f64;
        let mean = sum / n;
        let mut variance =
            (self.cumulative_squared_delay as f64 - 2.0 * mean * sum + n * mean * mean) / (n - 1.0);
        if variance <= 0.0 {
            variance = MIN_VARIANCE;
        }
        let stddev = variance.sqrt();
        self.load = if self.runavg_delay < mean {
            0.0
        } else {
            (self.runavg_delay - mean) / stddev
        };
    }

    /// Current load score.
    pub fn load(&self) -> f64 {
        self.load
    }

    /// Mean of all folded samples, `0.0` before the first sample.
    pub fn average(&self) -> f64 {
        if self.sample_count == 0 {
            return 0.0;
        }
        self.cumulative_delay as f64 / self.sample_count as f64
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}

/// Verdict of the datastore admission test for a given priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadVerdict {
    /// Load below 1: serve without charging priority.
    Free,
    /// Load covered by the offered priority.
    Normal,
    /// Load exceeds what the priority can buy.
    TooHigh,
}

impl LoadVerdict {
    /// Classify `load` against the priority a requester offers.
    pub fn classify(load: f64, priority: u32) -> Self {
        if load < 1.0 {
            Self::Free
        } else if load <= priority as f64 {
            Self::Normal
        } else {
            Self::TooHigh
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_is_zero_before_samples() {
        let load = LoadValue::new();
        assert_eq!(load.average(), 0.0);
        assert_eq!(load.load(), 0.0);
    }

    #[test]
    fn steady_samples_report_no_load() {
        let mut load = LoadValue::new();
        for _ in 0..50 {
            load.update(100);
        }
        assert_eq!(load.average(), 100.0);
        assert_eq!(load.load(), 0.0);
    }

    #[test]
    fn burst_above_mean_raises_load() {
        let mut load = LoadValue::new();
        for i in 0..100 {
            load.update(10 + (i % 3));
        }
        for _ in 0..5 {
            load.update(500);
        }
        assert!(load.load() > 1.0, "load was {}", load.load());
    }

    #[test]
    fn falling_delays_report_zero() {
        let mut load = LoadValue::new();
        for _ in 0..20 {
            load.update(1000);
        }
        for _ in 0..20 {
            load.update(1);
        }
        assert_eq!(load.load(), 0.0);
    }

    #[test]
    fn oversized_sample_saturates_without_folding() {
        let mut load = LoadValue::new();
        load.update(5);
        load.update(MAX_SAMPLE + 1);
        assert_eq!(load.load(), LOAD_SATURATED);
        assert_eq!(load.sample_count(), 1);
        assert_eq!(load.average(), 5.0);
    }

    #[test]
    fn verdict_thresholds() {
        assert_eq!(LoadVerdict::classify(0.5, 0), LoadVerdict::Free);
        assert_eq!(LoadVerdict::classify(3.0, 3), LoadVerdict::Normal);
        assert_eq!(LoadVerdict::classify(3.5, 3), LoadVerdict::TooHigh);
        assert_eq!(LoadVerdict::classify(99.5, 100), LoadVerdict::Normal);
    }
}
