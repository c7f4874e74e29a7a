use crate::algorithms::AlgorithmFault;
use crate::series::DataPoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Inputs handed to a custom algorithm for one evaluation.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub metric: String,
    pub parameters: serde_json::Value,
    /// Cancelled once the deadline passes. Long-running plugins should poll it and bail out;
    /// their result is discarded either way.
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    /// `None` abstains.
    pub anomalous: Option<bool>,
    pub score: Option<f64>,
    #[serde(default)]
    pub anomalies: BTreeMap<i64, serde_json::Value>,
}

/// User-supplied detector. Runs on a blocking worker, so it may do synchronous work freely.
pub trait CustomAlgorithm: Send + Sync + 'static {
    fn run(&self, ctx: &PluginContext, window: &[DataPoint]) -> anyhow::Result<PluginResult>;
}

impl<F> CustomAlgorithm for F
where
    F: Fn(&PluginContext, &[DataPoint]) -> anyhow::Result<PluginResult> + Send + Sync + 'static,
{
    fn run(&self, ctx: &PluginContext, window: &[DataPoint]) -> anyhow::Result<PluginResult> {
        self(ctx, window)
    }
}

#[derive(Clone)]
pub struct PluginSpec {
    pub name: String,
    pub algorithm: Arc<dyn CustomAlgorithm>,
    pub parameters: serde_json::Value,
    pub max_execution_time: Duration,
}

impl PluginSpec {
    pub fn new(
        name: impl Into<String>,
        algorithm: impl CustomAlgorithm,
        max_execution_time: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            algorithm: Arc::new(algorithm),
            parameters: serde_json::Value::Null,
            max_execution_time,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

impl fmt::Debug for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSpec")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("max_execution_time", &self.max_execution_time)
            .finish()
    }
}

/// Runs the plugin on a blocking worker joined with its deadline.
///
/// On expiry the cancellation token fires and the worker is abandoned; a blocking thread
/// cannot be preempted, so a plugin that ignores the token keeps its thread until it returns.
pub async fn run_with_deadline(
    spec: &PluginSpec,
    metric: &str,
    window: &[DataPoint],
) -> Result<PluginResult, AlgorithmFault> {
    let cancellation = CancellationToken::new();
    let ctx = PluginContext {
        metric: metric.to_string(),
        parameters: spec.parameters.clone(),
        cancellation: cancellation.clone(),
    };
    let algorithm = Arc::clone(&spec.algorithm);
    let window = window.to_vec();
    let handle = tokio::task::spawn_blocking(move || algorithm.run(&ctx, &window));

    match tokio::time::timeout(spec.max_execution_time, handle).await {
        Ok(Ok(Ok(result))) => Ok(result),
        Ok(Ok(Err(err))) => Err(AlgorithmFault::Plugin(format!("{err:#}"))),
        Ok(Err(join_err)) => Err(AlgorithmFault::Panicked(join_err.to_string())),
        Err(_) => {
            cancellation.cancel();
            tracing::warn!(
                plugin = %spec.name,
                metric = %metric,
                max_execution_ms = spec.max_execution_time.as_millis() as u64,
                "custom algorithm exceeded its deadline"
            );
            Err(AlgorithmFault::TimedOut(spec.max_execution_time))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::time::Instant;

    fn window() -> Vec<DataPoint> {
        (0..5).map(|i| DataPoint::new(i * 60, i as f64)).collect()
    }

    #[tokio::test]
    async fn plugin_result_is_returned_with_parameters() -> Result<()> {
        let spec = PluginSpec::new(
            "above_threshold",
            |ctx: &PluginContext, window: &[DataPoint]| -> Result<PluginResult> {
                let threshold = ctx.parameters["threshold"].as_f64().unwrap_or(f64::MAX);
                let last = window.last().map(|p| p.value).unwrap_or_default();
                Ok(PluginResult {
                    anomalous: Some(last > threshold),
                    score: Some(last),
                    anomalies: BTreeMap::new(),
                })
            },
            Duration::from_secs(1),
        )
        .with_parameters(serde_json::json!({ "threshold": 3.0 }));

        let result = run_with_deadline(&spec, "metrics.a", &window()).await?;
        assert_eq!(result.anomalous, Some(true));
        assert_eq!(result.score, Some(4.0));
        Ok(())
    }

    #[tokio::test]
    async fn plugin_error_becomes_fault() {
        let spec = PluginSpec::new(
            "broken",
            |_: &PluginContext, _: &[DataPoint]| -> Result<PluginResult> {
                Err(anyhow!("model file missing"))
            },
            Duration::from_secs(1),
        );
        let result = run_with_deadline(&spec, "metrics.a", &window()).await;
        assert!(matches!(result, Err(AlgorithmFault::Plugin(msg)) if msg.contains("model file")));
    }

    #[tokio::test]
    async fn plugin_panic_becomes_fault() {
        let spec = PluginSpec::new(
            "panicky",
            |_: &PluginContext, _: &[DataPoint]| -> Result<PluginResult> { panic!("boom") },
            Duration::from_secs(1),
        );
        let result = run_with_deadline(&spec, "metrics.a", &window()).await;
        assert!(matches!(result, Err(AlgorithmFault::Panicked(_))));
    }

    #[tokio::test]
    async fn slow_plugin_times_out_and_is_cancelled() {
        let spec = PluginSpec::new(
            "slow",
            |ctx: &PluginContext, _: &[DataPoint]| -> Result<PluginResult> {
                let started = Instant::now();
                while !ctx.cancellation.is_cancelled() && started.elapsed() < Duration::from_secs(5)
                {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(PluginResult::default())
            },
            Duration::from_millis(50),
        );
        let started = Instant::now();
        let result = run_with_deadline(&spec, "metrics.a", &window()).await;
        assert_eq!(
            result,
            Err(AlgorithmFault::TimedOut(Duration::from_millis(50)))
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
