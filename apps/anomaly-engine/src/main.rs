use anomaly_engine::algorithms::AlgorithmRegistry;
use anomaly_engine::config::Config;
use anomaly_engine::consensus::{ConsensusEngine, RunMetrics, RunMetricsSink};
use anomaly_engine::second_order::TriggerFilter;
use anomaly_engine::store::{build_pool, PgSeriesStore, SeriesStore};
use anomaly_engine::sweep::Sweep;
use anomaly_engine::vacuum::VacuumService;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,anomaly_engine=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "anomaly-engine"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    for warning in &config.warnings {
        tracing::warn!(warning = %warning, "configuration problem; using fallback");
    }

    let pool = build_pool(config.require_database_url()?, config.db_pool_size).await?;
    let pg_store = PgSeriesStore::new(pool);
    pg_store.ensure_schema().await?;
    let store: Arc<dyn SeriesStore> = Arc::new(pg_store);

    let registry = AlgorithmRegistry::builtin();
    let run_metrics = Arc::new(RunMetrics::new());
    let sink: Arc<dyn RunMetricsSink> = run_metrics.clone();
    let mut engine = ConsensusEngine::new(config.engine_settings()?, &registry)
        .context("invalid algorithm configuration")?
        .with_run_metrics(sink);
    if config.enable_second_order {
        engine = engine.with_second_order(TriggerFilter::new(Arc::clone(&store)));
    }
    tracing::info!(
        algorithms = ?config.algorithms,
        consensus = config.consensus,
        second_order = config.enable_second_order,
        "consensus engine ready"
    );

    let cancel = CancellationToken::new();
    let vacuum_handle =
        VacuumService::new(Arc::clone(&store), config.vacuum_settings()).start(cancel.clone());
    let analysis_handle = Sweep::new(
        Arc::clone(&store),
        Arc::new(engine),
        config.analysis_concurrency,
    )
    .with_run_metrics(run_metrics)
    .start(config.analysis_interval(), cancel.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();

    for (name, handle) in [("vacuum", vacuum_handle), ("analysis", analysis_handle)] {
        if let Err(err) = handle.await {
            tracing::error!(task = name, error = %err, "task failed during shutdown");
        }
    }

    Ok(())
}
