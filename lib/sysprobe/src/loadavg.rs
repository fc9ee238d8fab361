//! Load average emulation.
//!
//! Windows has no load average. It's emulated the way Unix kernels compute it: every [`SAMPLING_INTERVAL`], the
//! processor queue length is folded into three exponentially weighted moving averages with 1, 5 and 15 minute
//! windows. The sampler runs on an OS timer thread, so the averages live behind a `Mutex`.

use std::{sync::Mutex, time::Duration};

use crate::types::LoadAvg;

/// How often a sample is folded in.
pub const SAMPLING_INTERVAL: Duration = Duration::from_secs(5);

/// `exp(-5 / 60)`, `exp(-5 / 300)` and `exp(-5 / 900)`: the decay per sample for each window.
const LOADAVG_FACTOR_1F: f64 = 0.920_044_414_629_323_3;
const LOADAVG_FACTOR_5F: f64 = 0.983_471_453_821_617_5;
const LOADAVG_FACTOR_15F: f64 = 0.994_459_848_004_896_7;

/// Thread-safe load average accumulator.
#[derive(Debug, Default)]
pub struct LoadAverageTracker {
    averages: Mutex<LoadAvg>,
}

impl LoadAverageTracker {
    /// Creates a tracker with all averages at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in one sample of the run queue length (running plus ready threads).
    pub fn record(&self, current_load: f64) {
        let mut averages = match self.averages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        averages.one = decay(averages.one, LOADAVG_FACTOR_1F, current_load);
        averages.five = decay(averages.five, LOADAVG_FACTOR_5F, current_load);
        averages.fifteen = decay(averages.fifteen, LOADAVG_FACTOR_15F, current_load);
    }

    /// Returns the current averages.
    pub fn snapshot(&self) -> LoadAvg {
        match self.averages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn decay(average: f64, factor: f64, sample: f64) -> f64 {
    average * factor + sample * (1.0 - factor)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn starts_at_zero() {
        let tracker = LoadAverageTracker::new();
        assert_eq!(tracker.snapshot(), LoadAvg { one: 0.0, five: 0.0, fifteen: 0.0 });
    }

    #[test]
    fn one_minute_window_reacts_fastest() {
        let tracker = LoadAverageTracker::new();
        tracker.record(4.0);
        let avg = tracker.snapshot();
        assert!(avg.one > avg.five);
        assert!(avg.five > avg.fifteen);
        assert!((avg.one - 4.0 * (1.0 - LOADAVG_FACTOR_1F)).abs() < 1e-12);
    }

    #[test]
    fn converges_to_constant_load() {
        let tracker = LoadAverageTracker::new();
        // 15 minutes is 180 samples; go well past that.
        for _ in 0..2000 {
            tracker.record(2.0);
        }
        let avg = tracker.snapshot();
        assert!((avg.one - 2.0).abs() < 1e-6);
        assert!((avg.five - 2.0).abs() < 1e-3);
        assert!((avg.fifteen - 2.0).abs() < 1e-2);
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let tracker = Arc::new(LoadAverageTracker::new());
        let handles = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..500 {
                        tracker.record(1.0);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        // 2000 identical samples, interleaved or not, land on the same value.
        let expected = 1.0 - LOADAVG_FACTOR_1F.powi(2000);
        assert!((tracker.snapshot().one - expected).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn stays_within_sample_range(samples in proptest::collection::vec(0.0f64..64.0, 1..200)) {
            let tracker = LoadAverageTracker::new();
            let max = samples.iter().cloned().fold(0.0, f64::max);
            for sample in &samples {
                tracker.record(*sample);
            }
            let avg = tracker.snapshot();
            for value in [avg.one, avg.five, avg.fifteen] {
                prop_assert!(value >= 0.0);
                prop_assert!(value <= max + 1e-9);
            }
        }
    }
}
