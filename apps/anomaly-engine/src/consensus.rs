mod sinks;


pub use sinks::{AlgorithmTiming, ErrorSampler, RunMetrics, RunMetricsSink, SampledFault};

use crate::algorithms::{
    detect_drop_off_cliff, negatives_present, AlgorithmContext, AlgorithmFault,
    AlgorithmRegistry, Detector, DetectorFn, DropOffFloor, Verdict, DEFAULT_ALGORITHMS,
    DETECT_DROP_OFF_CLIFF,
};
use crate::plugin::{run_with_deadline, PluginSpec};
use crate::second_order::TriggerFilter;
use crate::series::DataPoint;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Metrics matching `pattern` get a standalone drop-off-cliff check ahead of the ensemble.
#[derive(Debug, Clone)]
pub struct DropOffCliffRule {
    pattern: Regex,
    pub floor: DropOffFloor,
}

impl DropOffCliffRule {
    /// `pattern` is anchored at the start of the metric key.
    pub fn new(pattern: &str, floor: DropOffFloor) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&format!("^(?:{pattern})"))?,
            floor,
        })
    }

    pub fn matches(&self, metric: &str) -> bool {
        self.pattern.is_match(metric)
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Ordered algorithm identifiers; each must be registered.
    pub algorithms: Vec<String>,
    pub consensus: usize,
    pub full_namespace: String,
    pub full_duration: i64,
    pub min_tolerable_length: usize,
    pub stale_period: i64,
    pub max_tolerable_boredom: usize,
    pub boredom_set_size: usize,
    pub run_optimized_workflow: bool,
    /// Forces every algorithm to run so timings cover the whole battery. Disables early exit.
    pub run_all_algorithms: bool,
    pub enable_run_metrics: bool,
    pub alert_on_stale_metrics: bool,
    pub alert_on_stale_period: i64,
    /// Base metric name to stale period override, in seconds.
    pub custom_stale_periods: HashMap<String, i64>,
    pub run_negatives_present: bool,
    pub drop_off_floor: DropOffFloor,
    pub drop_off_cliff_rules: Vec<DropOffCliffRule>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            algorithms: DEFAULT_ALGORITHMS.iter().map(|name| name.to_string()).collect(),
            consensus: 6,
            full_namespace: "metrics.".to_string(),
            full_duration: 86_400,
            min_tolerable_length: 1,
            stale_period: 500,
            max_tolerable_boredom: 100,
            boredom_set_size: 1,
            run_optimized_workflow: true,
            run_all_algorithms: false,
            enable_run_metrics: true,
            alert_on_stale_metrics: true,
            alert_on_stale_period: 300,
            custom_stale_periods: HashMap::new(),
            run_negatives_present: false,
            drop_off_floor: DropOffFloor::default(),
            drop_off_cliff_rules: Vec::new(),
        }
    }
}

impl EngineSettings {
    pub fn early_exit_enabled(&self) -> bool {
        self.run_optimized_workflow && !self.run_all_algorithms
    }

    /// Metric key with the full namespace prefix removed once.
    pub fn base_name<'a>(&self, metric: &'a str) -> &'a str {
        metric
            .strip_prefix(self.full_namespace.as_str())
            .unwrap_or(metric)
    }

    pub fn stale_period_for(&self, base_name: &str) -> i64 {
        self.custom_stale_periods
            .get(base_name)
            .copied()
            .unwrap_or(self.stale_period)
    }

    pub fn alert_on_stale_period_for(&self, base_name: &str) -> i64 {
        match self.custom_stale_periods.get(base_name) {
            Some(custom) => custom - custom / 4,
            None => self.alert_on_stale_period,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("algorithm {name:?} is not registered; known algorithms: {known}")]
    UnknownAlgorithm { name: String, known: String },
    #[error("consensus {consensus} must be between 1 and {algorithms}")]
    InvalidConsensus { consensus: usize, algorithms: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Empty,
    TooShort,
    Stale,
    Boring,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Empty => "empty",
            RejectReason::TooShort => "too_short",
            RejectReason::Stale => "stale",
            RejectReason::Boring => "boring",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefilter {
    Proceed,
    Reject(RejectReason),
}

/// Cheap screens that run before any algorithm. Order matters: a short stale window is
/// reported as short.
pub fn prefilter(
    window: &[DataPoint],
    now: i64,
    settings: &EngineSettings,
    base_name: &str,
) -> Prefilter {
    let Some(last) = window.last() else {
        return Prefilter::Reject(RejectReason::Empty);
    };
    if window.len() < settings.min_tolerable_length {
        return Prefilter::Reject(RejectReason::TooShort);
    }
    if now - last.timestamp > settings.stale_period_for(base_name) {
        return Prefilter::Reject(RejectReason::Stale);
    }
    let tail = &window[window.len().saturating_sub(settings.max_tolerable_boredom)..];
    let distinct: HashSet<u64> = tail
        .iter()
        // -0.0 and 0.0 are the same value
        .map(|p| (p.value + 0.0).to_bits())
        .collect();
    if distinct.len() == settings.boredom_set_size {
        return Prefilter::Reject(RejectReason::Boring);
    }
    Prefilter::Proceed
}

/// Whether a metric has gone quiet long enough to warn about, without yet being stale.
pub fn alert_on_stale(
    window: &[DataPoint],
    now: i64,
    settings: &EngineSettings,
    base_name: &str,
) -> bool {
    if !settings.alert_on_stale_metrics {
        return false;
    }
    let Some(last) = window.last() else {
        return false;
    };
    let age = now - last.timestamp;
    age >= settings.alert_on_stale_period_for(base_name)
        && age <= settings.stale_period_for(base_name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleEntry {
    pub algorithm: String,
    pub verdict: Verdict,
    /// `false` when early exit skipped the algorithm.
    pub executed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub anomalous: bool,
    pub ensemble: Vec<EnsembleEntry>,
    pub datapoint: DataPoint,
    pub early_exit: bool,
    pub suppressed_by_second_order: bool,
    pub negatives: Option<Vec<DataPoint>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Rejected(RejectReason),
    Decided(Decision),
}

impl CheckOutcome {
    pub fn is_anomalous(&self) -> bool {
        matches!(self, CheckOutcome::Decided(decision) if decision.anomalous)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricCheck {
    pub metric: String,
    pub outcome: CheckOutcome,
    pub alert_on_stale: bool,
}

/// Runs the configured detector battery over one metric window and applies the consensus rule.
///
/// Holds no per-metric state, so one engine can serve concurrent checks.
pub struct ConsensusEngine {
    settings: EngineSettings,
    detectors: Vec<(String, Detector)>,
    second_order: Option<TriggerFilter>,
    run_metrics: Option<Arc<dyn RunMetricsSink>>,
    errors: Arc<ErrorSampler>,
}

impl ConsensusEngine {
    pub fn new(settings: EngineSettings, registry: &AlgorithmRegistry) -> Result<Self, EngineError> {
        if let Some(name) = settings.algorithms.iter().find(|name| !registry.contains(name)) {
            return Err(EngineError::UnknownAlgorithm {
                name: name.clone(),
                known: registry.names().join(", "),
            });
        }
        let detectors: Vec<(String, Detector)> = settings
            .algorithms
            .iter()
            .filter_map(|name| {
                registry
                    .get(name)
                    .map(|detector| (name.clone(), detector.clone()))
            })
            .collect();
        if settings.consensus == 0 || settings.consensus > detectors.len() {
            return Err(EngineError::InvalidConsensus {
                consensus: settings.consensus,
                algorithms: detectors.len(),
            });
        }
        Ok(Self {
            settings,
            detectors,
            second_order: None,
            run_metrics: None,
            errors: Arc::new(ErrorSampler::new()),
        })
    }

    pub fn with_second_order(mut self, filter: TriggerFilter) -> Self {
        self.second_order = Some(filter);
        self
    }

    pub fn with_run_metrics(mut self, sink: Arc<dyn RunMetricsSink>) -> Self {
        self.run_metrics = Some(sink);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn error_sampler(&self) -> &Arc<ErrorSampler> {
        &self.errors
    }

    pub async fn check(&self, metric: &str, window: &[DataPoint], now: i64) -> MetricCheck {
        let base_name = self.settings.base_name(metric);
        let outcome = match prefilter(window, now, &self.settings, base_name) {
            Prefilter::Reject(reason) => CheckOutcome::Rejected(reason),
            Prefilter::Proceed => self.decide(metric, window, now).await,
        };
        MetricCheck {
            metric: metric.to_string(),
            alert_on_stale: alert_on_stale(window, now, &self.settings, base_name),
            outcome,
        }
    }

    async fn decide(&self, metric: &str, window: &[DataPoint], now: i64) -> CheckOutcome {
        let Some(&datapoint) = window.last() else {
            return CheckOutcome::Rejected(RejectReason::Empty);
        };
        let ctx = AlgorithmContext {
            metric: metric.to_string(),
            full_duration: self.settings.full_duration,
            drop_off_floor: self.settings.drop_off_floor,
        };

        if let Some(rule) = self
            .settings
            .drop_off_cliff_rules
            .iter()
            .find(|rule| rule.matches(metric))
        {
            let cliff_ctx = AlgorithmContext {
                drop_off_floor: rule.floor,
                ..ctx.clone()
            };
            let verdict =
                self.run_builtin(DETECT_DROP_OFF_CLIFF, detect_drop_off_cliff, window, &cliff_ctx);
            if verdict == Verdict::Anomalous {
                tracing::info!(metric = %metric, pattern = rule.pattern(), "drop off cliff");
                return CheckOutcome::Decided(Decision {
                    anomalous: true,
                    ensemble: vec![EnsembleEntry {
                        algorithm: DETECT_DROP_OFF_CLIFF.to_string(),
                        verdict,
                        executed: true,
                    }],
                    datapoint,
                    early_exit: false,
                    suppressed_by_second_order: false,
                    negatives: self.negatives(window),
                });
            }
        }

        let (ensemble, early_exit) = self.run_ensemble(window, &ctx).await;
        let false_count = ensemble.iter().filter(|e| e.verdict.is_false()).count();
        let all_unknown = ensemble.iter().all(|e| e.verdict == Verdict::Unknown);
        let threshold = self.detectors.len() - self.settings.consensus;
        let mut anomalous = !early_exit && !all_unknown && false_count <= threshold;

        let mut suppressed_by_second_order = false;
        if anomalous {
            if let Some(filter) = &self.second_order {
                let surface = match filter.evaluate(metric, now, datapoint.value).await {
                    Ok(surface) => surface,
                    Err(err) => {
                        tracing::warn!(
                            metric = %metric,
                            error = %err,
                            "second order check failed; suppressing trigger"
                        );
                        false
                    }
                };
                if !surface {
                    anomalous = false;
                    suppressed_by_second_order = true;
                }
            }
        }

        CheckOutcome::Decided(Decision {
            anomalous,
            negatives: if anomalous { self.negatives(window) } else { None },
            ensemble,
            datapoint,
            early_exit,
            suppressed_by_second_order,
        })
    }

    /// Runs detectors in order. Once enough have voted `false` that consensus is out of reach,
    /// the rest are recorded as skipped unknowns (unless every algorithm must run).
    pub async fn run_ensemble(
        &self,
        window: &[DataPoint],
        ctx: &AlgorithmContext,
    ) -> (Vec<EnsembleEntry>, bool) {
        let max_false = self.detectors.len() - self.settings.consensus + 1;
        let early_exit_enabled = self.settings.early_exit_enabled();
        let mut ensemble = Vec::with_capacity(self.detectors.len());
        let mut false_count = 0;
        let mut early_exit = false;

        for (name, detector) in &self.detectors {
            if early_exit_enabled && false_count >= max_false {
                early_exit = true;
                ensemble.push(EnsembleEntry {
                    algorithm: name.clone(),
                    verdict: Verdict::Unknown,
                    executed: false,
                });
                continue;
            }

            let started = Instant::now();
            let verdict = match detector {
                Detector::Builtin(detector) => self.run_builtin(name, *detector, window, ctx),
                Detector::Plugin(spec) => self.run_plugin(spec, window, ctx).await,
            };
            if self.settings.enable_run_metrics {
                if let Some(sink) = &self.run_metrics {
                    sink.record(name, started.elapsed());
                }
            }
            if verdict.is_false() {
                false_count += 1;
            }
            ensemble.push(EnsembleEntry {
                algorithm: name.clone(),
                verdict,
                executed: true,
            });
        }
        (ensemble, early_exit)
    }

    fn run_builtin(
        &self,
        name: &str,
        detector: DetectorFn,
        window: &[DataPoint],
        ctx: &AlgorithmContext,
    ) -> Verdict {
        let result = catch_unwind(AssertUnwindSafe(|| detector(window, ctx)))
            .unwrap_or_else(|payload| Err(AlgorithmFault::Panicked(panic_message(&*payload))));
        self.settle(name, &ctx.metric, result)
    }

    async fn run_plugin(
        &self,
        spec: &PluginSpec,
        window: &[DataPoint],
        ctx: &AlgorithmContext,
    ) -> Verdict {
        let result = run_with_deadline(spec, &ctx.metric, window)
            .await
            .map(|result| result.anomalous);
        match result {
            Ok(Some(anomalous)) => anomalous.into(),
            Ok(None) => Verdict::Unknown,
            Err(fault) => self.settle(&spec.name, &ctx.metric, Err(fault)),
        }
    }

    fn settle(&self, name: &str, metric: &str, result: Result<bool, AlgorithmFault>) -> Verdict {
        if let Err(fault) = &result {
            tracing::debug!(algorithm = name, metric = %metric, error = %fault, "algorithm fault");
            self.errors.record(name, metric, fault.clone());
        }
        result.into()
    }

    fn negatives(&self, window: &[DataPoint]) -> Option<Vec<DataPoint>> {
        if self.settings.run_negatives_present {
            negatives_present(window)
        } else {
            None
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
