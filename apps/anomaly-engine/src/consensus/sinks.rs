use crate::algorithms::AlgorithmFault;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receives one record per executed algorithm when run metrics are enabled.
pub trait RunMetricsSink: Send + Sync {
    fn record(&self, algorithm: &str, elapsed: Duration);
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AlgorithmTiming {
    pub count: u64,
    pub total: Duration,
}

impl AlgorithmTiming {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / u32::try_from(self.count).unwrap_or(u32::MAX)
        }
    }
}

/// Per-algorithm invocation counts and elapsed time, aggregated until drained.
#[derive(Debug, Default)]
pub struct RunMetrics {
    timings: Mutex<BTreeMap<String, AlgorithmTiming>>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, AlgorithmTiming> {
        lock(&self.timings).clone()
    }

    pub fn drain(&self) -> BTreeMap<String, AlgorithmTiming> {
        std::mem::take(&mut *lock(&self.timings))
    }
}

impl RunMetricsSink for RunMetrics {
    fn record(&self, algorithm: &str, elapsed: Duration) {
        let mut timings = lock(&self.timings);
        let timing = timings.entry(algorithm.to_string()).or_default();
        timing.count += 1;
        timing.total += elapsed;
    }
}

/// Keeps the first fault seen per algorithm until the next drain, so a detector failing on
/// every metric produces one diagnostic per pass.
#[derive(Debug, Default)]
pub struct ErrorSampler {
    samples: Mutex<BTreeMap<String, SampledFault>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampledFault {
    pub metric: String,
    pub fault: AlgorithmFault,
    /// Faults of the same algorithm seen after the sample was taken.
    pub suppressed: u64,
}

impl ErrorSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, algorithm: &str, metric: &str, fault: AlgorithmFault) {
        let mut samples = lock(&self.samples);
        match samples.get_mut(algorithm) {
            Some(sample) => sample.suppressed += 1,
            None => {
                samples.insert(
                    algorithm.to_string(),
                    SampledFault {
                        metric: metric.to_string(),
                        fault,
                        suppressed: 0,
                    },
                );
            }
        }
    }

    pub fn drain(&self) -> BTreeMap<String, SampledFault> {
        std::mem::take(&mut *lock(&self.samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_metrics_aggregate_per_algorithm() {
        let metrics = RunMetrics::new();
        metrics.record("grubbs", Duration::from_millis(2));
        metrics.record("grubbs", Duration::from_millis(4));
        metrics.record("ks_test", Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["grubbs"].count, 2);
        assert_eq!(snapshot["grubbs"].mean(), Duration::from_millis(3));

        assert_eq!(metrics.drain().len(), 2);
        assert!(metrics.snapshot().is_empty());
    }

    #[test]
    fn error_sampler_keeps_first_fault_until_drained() {
        let sampler = ErrorSampler::new();
        sampler.record("grubbs", "metrics.a", AlgorithmFault::EmptyWindow);
        sampler.record(
            "grubbs",
            "metrics.b",
            AlgorithmFault::Numerical("nan".into()),
        );

        let drained = sampler.drain();
        let sample = &drained["grubbs"];
        assert_eq!(sample.metric, "metrics.a");
        assert_eq!(sample.fault, AlgorithmFault::EmptyWindow);
        assert_eq!(sample.suppressed, 1);
        assert!(sampler.drain().is_empty());
    }
}
