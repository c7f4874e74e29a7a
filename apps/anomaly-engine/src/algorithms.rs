mod detectors;
pub mod stats;

#[cfg(test)]
mod tests;

pub use detectors::{
    detect_drop_off_cliff, first_hour_average, grubbs, histogram_bins, ks_test, least_squares,
    mean_subtraction_cumulation, median_absolute_deviation, stddev_from_average,
    stddev_from_moving_average,
};

use crate::plugin::PluginSpec;
use crate::series::DataPoint;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const HISTOGRAM_BINS: &str = "histogram_bins";
pub const FIRST_HOUR_AVERAGE: &str = "first_hour_average";
pub const STDDEV_FROM_AVERAGE: &str = "stddev_from_average";
pub const GRUBBS: &str = "grubbs";
pub const KS_TEST: &str = "ks_test";
pub const MEAN_SUBTRACTION_CUMULATION: &str = "mean_subtraction_cumulation";
pub const MEDIAN_ABSOLUTE_DEVIATION: &str = "median_absolute_deviation";
pub const STDDEV_FROM_MOVING_AVERAGE: &str = "stddev_from_moving_average";
pub const LEAST_SQUARES: &str = "least_squares";
pub const DETECT_DROP_OFF_CLIFF: &str = "detect_drop_off_cliff";

/// The three-sigma battery in its canonical run order.
pub const DEFAULT_ALGORITHMS: [&str; 9] = [
    HISTOGRAM_BINS,
    FIRST_HOUR_AVERAGE,
    STDDEV_FROM_AVERAGE,
    GRUBBS,
    KS_TEST,
    MEAN_SUBTRACTION_CUMULATION,
    MEDIAN_ABSOLUTE_DEVIATION,
    STDDEV_FROM_MOVING_AVERAGE,
    LEAST_SQUARES,
];

/// Tri-state detector output. `Unknown` abstains from both the false count and the consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Anomalous,
    NotAnomalous,
    Unknown,
}

impl Verdict {
    pub fn is_true(self) -> bool {
        matches!(self, Verdict::Anomalous)
    }

    pub fn is_false(self) -> bool {
        matches!(self, Verdict::NotAnomalous)
    }
}

impl From<bool> for Verdict {
    fn from(anomalous: bool) -> Self {
        if anomalous {
            Verdict::Anomalous
        } else {
            Verdict::NotAnomalous
        }
    }
}

impl From<Result<bool, AlgorithmFault>> for Verdict {
    fn from(result: Result<bool, AlgorithmFault>) -> Self {
        match result {
            Ok(anomalous) => anomalous.into(),
            Err(_) => Verdict::Unknown,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Anomalous => f.write_str("true"),
            Verdict::NotAnomalous => f.write_str("false"),
            Verdict::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlgorithmFault {
    #[error("window is empty")]
    EmptyWindow,
    #[error("numerical fault: {0}")]
    Numerical(String),
    #[error("detector panicked: {0}")]
    Panicked(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("plugin failed: {0}")]
    Plugin(String),
}

/// Floor applied by the drop-off-cliff detector: a cliff only counts when the average over
/// the trailing `seconds` exceeds `average`. Disabled while either is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DropOffFloor {
    pub average: f64,
    pub seconds: i64,
}

/// Immutable per-check inputs shared by every detector.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmContext {
    pub metric: String,
    /// Retention window the series is kept for, in seconds.
    pub full_duration: i64,
    pub drop_off_floor: DropOffFloor,
}

impl AlgorithmContext {
    pub fn new(metric: impl Into<String>, full_duration: i64) -> Self {
        Self {
            metric: metric.into(),
            full_duration,
            drop_off_floor: DropOffFloor::default(),
        }
    }
}

pub type DetectorFn = fn(&[DataPoint], &AlgorithmContext) -> Result<bool, AlgorithmFault>;

#[derive(Clone)]
pub enum Detector {
    Builtin(DetectorFn),
    Plugin(Arc<PluginSpec>),
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detector::Builtin(_) => f.write_str("Detector::Builtin"),
            Detector::Plugin(spec) => write!(f, "Detector::Plugin({})", spec.name),
        }
    }
}

/// Identifier to detector lookup, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmRegistry {
    detectors: HashMap<String, Detector>,
}

impl AlgorithmRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every builtin detector.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let builtins: [(&str, DetectorFn); 10] = [
            (HISTOGRAM_BINS, histogram_bins),
            (FIRST_HOUR_AVERAGE, first_hour_average),
            (STDDEV_FROM_AVERAGE, stddev_from_average),
            (GRUBBS, grubbs),
            (KS_TEST, ks_test),
            (MEAN_SUBTRACTION_CUMULATION, mean_subtraction_cumulation),
            (MEDIAN_ABSOLUTE_DEVIATION, median_absolute_deviation),
            (STDDEV_FROM_MOVING_AVERAGE, stddev_from_moving_average),
            (LEAST_SQUARES, least_squares),
            (DETECT_DROP_OFF_CLIFF, detect_drop_off_cliff),
        ];
        for (name, detector) in builtins {
            registry.register(name, detector);
        }
        registry
    }

    pub fn register(&mut self, name: &str, detector: DetectorFn) {
        self.detectors
            .insert(name.to_string(), Detector::Builtin(detector));
    }

    pub fn register_plugin(&mut self, spec: PluginSpec) {
        self.detectors
            .insert(spec.name.clone(), Detector::Plugin(Arc::new(spec)));
    }

    pub fn get(&self, name: &str) -> Option<&Detector> {
        self.detectors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.detectors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.detectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Mean of the last three values, or the last value alone when fewer than three exist.
pub fn tail_avg(window: &[DataPoint]) -> Option<f64> {
    let start = window.len().saturating_sub(3);
    let values: Vec<f64> = window[start..].iter().map(|p| p.value).collect();
    stats::tail_average(&values)
}

/// Datapoints with a negative value, or `None` when the window has none.
pub fn negatives_present(window: &[DataPoint]) -> Option<Vec<DataPoint>> {
    let negatives: Vec<DataPoint> = window.iter().filter(|p| p.value < 0.0).copied().collect();
    if negatives.is_empty() {
        None
    } else {
        Some(negatives)
    }
}

pub(crate) fn values(window: &[DataPoint]) -> Vec<f64> {
    window.iter().map(|p| p.value).collect()
}
