use crate::consensus::{CheckOutcome, ConsensusEngine, MetricCheck, RunMetrics};
use crate::reader::WindowReader;
use crate::store::{index_key, SeriesStore, StoreError};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Store set collecting metrics that are going quiet but not yet stale.
pub const ALERT_ON_STALE_METRICS_KEY: &str = "analyzer.alert_on_stale_metrics";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub metrics: usize,
    pub anomalous: Vec<String>,
    pub rejected: BTreeMap<&'static str, usize>,
    pub suppressed_by_second_order: usize,
    pub alert_on_stale: usize,
    pub missing: usize,
    pub read_errors: usize,
}

enum Lookup {
    Checked(MetricCheck),
    Missing,
    Failed(String, StoreError),
}

/// Analysis pass over the full namespace: every indexed metric is read and checked, with at most
/// `concurrency` checks in flight.
pub struct Sweep {
    store: Arc<dyn SeriesStore>,
    reader: WindowReader,
    engine: Arc<ConsensusEngine>,
    run_metrics: Option<Arc<RunMetrics>>,
    concurrency: usize,
}

impl Sweep {
    pub fn new(store: Arc<dyn SeriesStore>, engine: Arc<ConsensusEngine>, concurrency: usize) -> Self {
        Self {
            reader: WindowReader::new(Arc::clone(&store)),
            store,
            engine,
            run_metrics: None,
            concurrency: concurrency.max(1),
        }
    }

    /// Timings recorded by the engine into this sink are logged and reset after every pass.
    pub fn with_run_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.run_metrics = Some(metrics);
        self
    }

    async fn lookup(&self, key: String, now: i64) -> Lookup {
        match self.reader.read(&key).await {
            Ok(Some(window)) => Lookup::Checked(self.engine.check(&key, &window, now).await),
            Ok(None) => Lookup::Missing,
            Err(err) => Lookup::Failed(key, err),
        }
    }

    pub async fn run_pass(&self, now: i64) -> Result<SweepReport, StoreError> {
        let namespace = &self.engine.settings().full_namespace;
        let keys = self.store.members(&index_key(namespace)).await?;
        let mut report = SweepReport::default();

        let lookups: Vec<Lookup> = stream::iter(keys)
            .map(|key| self.lookup(key, now))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for lookup in lookups {
            let check = match lookup {
                Lookup::Checked(check) => check,
                Lookup::Missing => {
                    report.missing += 1;
                    continue;
                }
                Lookup::Failed(key, err) => {
                    report.read_errors += 1;
                    tracing::warn!(metric = %key, error = %err, "failed to read metric window");
                    continue;
                }
            };
            report.metrics += 1;

            if check.alert_on_stale {
                report.alert_on_stale += 1;
                if let Err(err) = self
                    .store
                    .add_member(ALERT_ON_STALE_METRICS_KEY, &check.metric)
                    .await
                {
                    tracing::warn!(metric = %check.metric, error = %err, "failed to record stale alert");
                }
            }

            match &check.outcome {
                CheckOutcome::Rejected(reason) => {
                    *report.rejected.entry(reason.as_str()).or_default() += 1;
                }
                CheckOutcome::Decided(decision) if decision.anomalous => {
                    let triggered: Vec<&str> = decision
                        .ensemble
                        .iter()
                        .filter(|entry| entry.verdict.is_true())
                        .map(|entry| entry.algorithm.as_str())
                        .collect();
                    tracing::info!(
                        metric = %check.metric,
                        timestamp = decision.datapoint.timestamp,
                        value = decision.datapoint.value,
                        algorithms = ?triggered,
                        "anomaly detected"
                    );
                    report.anomalous.push(check.metric);
                }
                CheckOutcome::Decided(decision) => {
                    if decision.suppressed_by_second_order {
                        report.suppressed_by_second_order += 1;
                    }
                }
            }
        }
        report.anomalous.sort();

        self.flush_diagnostics();
        Ok(report)
    }

    fn flush_diagnostics(&self) {
        if let Some(metrics) = &self.run_metrics {
            for (algorithm, timing) in metrics.drain() {
                tracing::info!(
                    algorithm = %algorithm,
                    runs = timing.count,
                    total_ms = timing.total.as_secs_f64() * 1000.0,
                    mean_ms = timing.mean().as_secs_f64() * 1000.0,
                    "algorithm run metrics"
                );
            }
        }
        for (algorithm, sample) in self.engine.error_sampler().drain() {
            tracing::warn!(
                algorithm = %algorithm,
                metric = %sample.metric,
                error = %sample.fault,
                suppressed = sample.suppressed,
                "algorithm failed"
            );
        }
    }

    /// Runs a pass every `interval` until cancelled.
    pub fn start(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let started = Instant::now();
                let now = chrono::Utc::now().timestamp();
                match self.run_pass(now).await {
                    Ok(report) => tracing::info!(
                        metrics = report.metrics,
                        anomalous = report.anomalous.len(),
                        rejected = report.rejected.values().sum::<usize>(),
                        alert_on_stale = report.alert_on_stale,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "analysis pass complete"
                    ),
                    Err(err) => tracing::warn!(error = %err, "analysis pass failed"),
                }
            }
            tracing::info!("analysis stopped");
        })
    }
}
