use crate::algorithms::{DropOffFloor, DEFAULT_ALGORITHMS};
use crate::consensus::{DropOffCliffRule, EngineSettings};
use crate::plugin::{CustomAlgorithm, PluginSpec};
use crate::vacuum::VacuumSettings;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DROP_OFF_CLIFF_SECONDS: i64 = 1_200;

fn setup_config_path() -> Option<PathBuf> {
    env::var("ANOMALY_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// A metric pattern that gets a standalone drop-off-cliff check.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DropOffCliffMetric {
    pub pattern: String,
    #[serde(default)]
    pub min_average: Option<f64>,
    #[serde(default)]
    pub min_average_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    full_namespace: Option<String>,
    #[serde(default)]
    mini_namespace: Option<String>,
    #[serde(default)]
    full_duration: Option<i64>,
    #[serde(default)]
    mini_duration: Option<i64>,
    #[serde(default)]
    vacuum_skip_mini: Option<bool>,
    #[serde(default)]
    vacuum_processes: Option<usize>,
    #[serde(default)]
    vacuum_grace_seconds: Option<i64>,
    #[serde(default)]
    vacuum_timeout_seconds: Option<u64>,
    #[serde(default)]
    vacuum_optimum_run_seconds: Option<u64>,
    #[serde(default)]
    min_tolerable_length: Option<usize>,
    #[serde(default)]
    stale_period: Option<i64>,
    #[serde(default)]
    max_tolerable_boredom: Option<usize>,
    #[serde(default)]
    boredom_set_size: Option<usize>,
    #[serde(default)]
    algorithms: Option<Vec<String>>,
    #[serde(default)]
    consensus: Option<usize>,
    #[serde(default)]
    enable_second_order: Option<bool>,
    #[serde(default)]
    run_optimized_workflow: Option<bool>,
    #[serde(default)]
    enable_algorithm_run_metrics: Option<bool>,
    #[serde(default)]
    enable_all_algorithms_run_metrics: Option<bool>,
    #[serde(default)]
    alert_on_stale_metrics: Option<bool>,
    #[serde(default)]
    alert_on_stale_period: Option<i64>,
    #[serde(default)]
    run_negatives_present: Option<bool>,
    #[serde(default)]
    drop_off_min_average: Option<f64>,
    #[serde(default)]
    drop_off_min_average_seconds: Option<i64>,
    #[serde(default)]
    analysis_interval_ms: Option<u64>,
    #[serde(default)]
    analysis_concurrency: Option<usize>,
    #[serde(default)]
    plugin_max_execution_ms: Option<u64>,
    #[serde(default)]
    custom_stale_periods: Option<HashMap<String, i64>>,
    #[serde(default)]
    drop_off_cliff_metrics: Option<Vec<DropOffCliffMetric>>,
}

fn load_setup_config_overrides(
    path: &Path,
    warnings: &mut Vec<String>,
) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warnings.push(format!(
                "failed to read setup config {}: {err}; using env defaults",
                path.display()
            ));
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warnings.push(format!(
                "failed to parse setup config {}: {err}; using env defaults",
                path.display()
            ));
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Environment first, then the setup file, then the default. A value that fails to parse is
/// ignored with a warning.
///
/// Warnings are collected rather than logged since settings load before tracing is installed.
struct Source<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
    warnings: RefCell<Vec<String>>,
}

impl Source<'_> {
    fn warn(&self, message: String) {
        self.warnings.borrow_mut().push(message);
    }

    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.raw(key)?;
        match raw.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                self.warn(format!("ignoring unparseable setting {key}={raw:?}"));
                None
            }
        }
    }

    fn get<T: FromStr>(&self, key: &str, setup: Option<T>, default: T) -> T {
        self.parsed(key).or(setup).unwrap_or(default)
    }

    /// Like `get`, but zero is not a usable value for counts, timeouts or intervals.
    fn nonzero<T: FromStr + Default + PartialEq>(
        &self,
        key: &str,
        setup: Option<T>,
        default: T,
    ) -> T {
        let zero = T::default();
        let from_env = self.parsed(key).filter(|value: &T| {
            if *value == zero {
                self.warn(format!("ignoring zero {key}; it must be positive"));
            }
            *value != zero
        });
        let setup = setup.filter(|value| {
            if *value == zero {
                self.warn(format!("ignoring zero {key} from setup config"));
            }
            *value != zero
        });
        from_env.or(setup).unwrap_or(default)
    }

    fn flag(&self, key: &str, setup: Option<bool>, default: bool) -> bool {
        let from_env = self.raw(key).and_then(|raw| {
            let parsed = parse_bool(&raw);
            if parsed.is_none() {
                self.warn(format!("ignoring unparseable flag {key}={raw:?}"));
            }
            parsed
        });
        from_env.or(setup).unwrap_or(default)
    }

    fn string(&self, key: &str, setup: Option<String>, default: &str) -> String {
        self.raw(key)
            .or(setup.map(|value| value.trim().to_string()).filter(|v| !v.is_empty()))
            .unwrap_or_else(|| default.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub full_namespace: String,
    pub mini_namespace: String,
    pub full_duration: i64,
    pub mini_duration: i64,
    pub vacuum_skip_mini: bool,
    pub vacuum_processes: usize,
    pub vacuum_grace_seconds: i64,
    pub vacuum_timeout_seconds: u64,
    pub vacuum_optimum_run_seconds: u64,
    pub min_tolerable_length: usize,
    pub stale_period: i64,
    pub max_tolerable_boredom: usize,
    pub boredom_set_size: usize,
    pub algorithms: Vec<String>,
    pub consensus: usize,
    pub enable_second_order: bool,
    pub run_optimized_workflow: bool,
    pub enable_algorithm_run_metrics: bool,
    pub enable_all_algorithms_run_metrics: bool,
    pub alert_on_stale_metrics: bool,
    pub alert_on_stale_period: i64,
    pub run_negatives_present: bool,
    pub drop_off_min_average: f64,
    pub drop_off_min_average_seconds: i64,
    pub analysis_interval_ms: u64,
    pub analysis_concurrency: usize,
    pub plugin_max_execution_ms: u64,
    pub custom_stale_periods: HashMap<String, i64>,
    pub drop_off_cliff_metrics: Vec<DropOffCliffMetric>,
    pub otlp_endpoint: Option<String>,
    /// Problems found while loading, to be logged once tracing is up.
    pub warnings: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let mut setup_warnings = Vec::new();
        let overrides = setup_config_path()
            .and_then(|path| load_setup_config_overrides(&path, &mut setup_warnings))
            .unwrap_or_default();
        let mut config = Self::from_sources(&|key: &str| env::var(key).ok(), overrides);
        setup_warnings.append(&mut config.warnings);
        config.warnings = setup_warnings;
        Ok(config)
    }

    fn from_sources(
        lookup: &dyn Fn(&str) -> Option<String>,
        overrides: SetupConfigOverrides,
    ) -> Self {
        let source = Source {
            lookup,
            warnings: RefCell::new(Vec::new()),
        };

        let database_url = source
            .raw("ANOMALY_DATABASE_URL")
            .or_else(|| source.raw("DATABASE_URL"))
            .or_else(|| {
                overrides
                    .database_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
            .map(normalize_database_url);

        let algorithms = source
            .raw("ANOMALY_ALGORITHMS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|names| !names.is_empty())
            .or(overrides.algorithms)
            .unwrap_or_else(|| DEFAULT_ALGORITHMS.iter().map(|name| name.to_string()).collect());

        let mut config = Self {
            database_url,
            db_pool_size: source.nonzero("ANOMALY_DB_POOL_SIZE", None, 10),
            full_namespace: source.string(
                "ANOMALY_FULL_NAMESPACE",
                overrides.full_namespace,
                "metrics.",
            ),
            mini_namespace: source.string(
                "ANOMALY_MINI_NAMESPACE",
                overrides.mini_namespace,
                "mini.",
            ),
            full_duration: source.get("ANOMALY_FULL_DURATION", overrides.full_duration, 86_400),
            mini_duration: source.get("ANOMALY_MINI_DURATION", overrides.mini_duration, 3_600),
            vacuum_skip_mini: source.flag(
                "ANOMALY_VACUUM_SKIP_MINI",
                overrides.vacuum_skip_mini,
                false,
            ),
            vacuum_processes: source.nonzero(
                "ANOMALY_VACUUM_PROCESSES",
                overrides.vacuum_processes,
                1,
            ),
            vacuum_grace_seconds: source.get(
                "ANOMALY_VACUUM_GRACE_SECONDS",
                overrides.vacuum_grace_seconds,
                600,
            ),
            vacuum_timeout_seconds: source.nonzero(
                "ANOMALY_VACUUM_TIMEOUT_SECONDS",
                overrides.vacuum_timeout_seconds,
                100,
            ),
            vacuum_optimum_run_seconds: source.get(
                "ANOMALY_VACUUM_OPTIMUM_RUN_SECONDS",
                overrides.vacuum_optimum_run_seconds,
                60,
            ),
            min_tolerable_length: source.get(
                "ANOMALY_MIN_TOLERABLE_LENGTH",
                overrides.min_tolerable_length,
                1,
            ),
            stale_period: source.get("ANOMALY_STALE_PERIOD", overrides.stale_period, 500),
            max_tolerable_boredom: source.get(
                "ANOMALY_MAX_TOLERABLE_BOREDOM",
                overrides.max_tolerable_boredom,
                100,
            ),
            boredom_set_size: source.get(
                "ANOMALY_BOREDOM_SET_SIZE",
                overrides.boredom_set_size,
                1,
            ),
            algorithms,
            consensus: source.get("ANOMALY_CONSENSUS", overrides.consensus, 6),
            enable_second_order: source.flag(
                "ANOMALY_ENABLE_SECOND_ORDER",
                overrides.enable_second_order,
                false,
            ),
            run_optimized_workflow: source.flag(
                "ANOMALY_RUN_OPTIMIZED_WORKFLOW",
                overrides.run_optimized_workflow,
                true,
            ),
            enable_algorithm_run_metrics: source.flag(
                "ANOMALY_ENABLE_ALGORITHM_RUN_METRICS",
                overrides.enable_algorithm_run_metrics,
                true,
            ),
            enable_all_algorithms_run_metrics: source.flag(
                "ANOMALY_ENABLE_ALL_ALGORITHMS_RUN_METRICS",
                overrides.enable_all_algorithms_run_metrics,
                false,
            ),
            alert_on_stale_metrics: source.flag(
                "ANOMALY_ALERT_ON_STALE_METRICS",
                overrides.alert_on_stale_metrics,
                true,
            ),
            alert_on_stale_period: source.get(
                "ANOMALY_ALERT_ON_STALE_PERIOD",
                overrides.alert_on_stale_period,
                300,
            ),
            run_negatives_present: source.flag(
                "ANOMALY_RUN_NEGATIVES_PRESENT",
                overrides.run_negatives_present,
                false,
            ),
            drop_off_min_average: source.get(
                "ANOMALY_DROP_OFF_MIN_AVERAGE",
                overrides.drop_off_min_average,
                0.0,
            ),
            drop_off_min_average_seconds: source.get(
                "ANOMALY_DROP_OFF_MIN_AVERAGE_SECONDS",
                overrides.drop_off_min_average_seconds,
                0,
            ),
            analysis_interval_ms: source.nonzero(
                "ANOMALY_ANALYSIS_INTERVAL_MS",
                overrides.analysis_interval_ms,
                60_000,
            ),
            analysis_concurrency: source.nonzero(
                "ANOMALY_ANALYSIS_CONCURRENCY",
                overrides.analysis_concurrency,
                16,
            ),
            plugin_max_execution_ms: source.nonzero(
                "ANOMALY_PLUGIN_MAX_EXECUTION_MS",
                overrides.plugin_max_execution_ms,
                5_000,
            ),
            custom_stale_periods: overrides.custom_stale_periods.unwrap_or_default(),
            drop_off_cliff_metrics: overrides.drop_off_cliff_metrics.unwrap_or_default(),
            otlp_endpoint: source.raw("OTEL_EXPORTER_OTLP_ENDPOINT"),
            warnings: Vec::new(),
        };
        config.warnings = source.warnings.into_inner();
        config
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url.as_deref().context(
            "ANOMALY_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)",
        )
    }

    /// Fails on an invalid drop-off-cliff pattern. Algorithm names and consensus are checked
    /// when the engine is built against a registry.
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        let drop_off_cliff_rules = self
            .drop_off_cliff_metrics
            .iter()
            .map(|metric| {
                let floor = DropOffFloor {
                    average: metric.min_average.unwrap_or(0.0),
                    seconds: metric
                        .min_average_seconds
                        .unwrap_or(DEFAULT_DROP_OFF_CLIFF_SECONDS),
                };
                DropOffCliffRule::new(&metric.pattern, floor).with_context(|| {
                    format!("invalid drop_off_cliff_metrics pattern {:?}", metric.pattern)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EngineSettings {
            algorithms: self.algorithms.clone(),
            consensus: self.consensus,
            full_namespace: self.full_namespace.clone(),
            full_duration: self.full_duration,
            min_tolerable_length: self.min_tolerable_length,
            stale_period: self.stale_period,
            max_tolerable_boredom: self.max_tolerable_boredom,
            boredom_set_size: self.boredom_set_size,
            run_optimized_workflow: self.run_optimized_workflow,
            run_all_algorithms: self.enable_all_algorithms_run_metrics,
            enable_run_metrics: self.enable_algorithm_run_metrics,
            alert_on_stale_metrics: self.alert_on_stale_metrics,
            alert_on_stale_period: self.alert_on_stale_period,
            custom_stale_periods: self.custom_stale_periods.clone(),
            run_negatives_present: self.run_negatives_present,
            drop_off_floor: DropOffFloor {
                average: self.drop_off_min_average,
                seconds: self.drop_off_min_average_seconds,
            },
            drop_off_cliff_rules,
        })
    }

    pub fn vacuum_settings(&self) -> VacuumSettings {
        VacuumSettings {
            full_namespace: self.full_namespace.clone(),
            mini_namespace: self.mini_namespace.clone(),
            full_duration: self.full_duration,
            mini_duration: self.mini_duration,
            skip_mini: self.vacuum_skip_mini,
            processes: self.vacuum_processes,
            grace: self.vacuum_grace_seconds,
            pass_timeout: Duration::from_secs(self.vacuum_timeout_seconds),
            optimum_run: Duration::from_secs(self.vacuum_optimum_run_seconds),
        }
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms)
    }

    pub fn plugin_max_execution(&self) -> Duration {
        Duration::from_millis(self.plugin_max_execution_ms)
    }

    /// Wraps a custom algorithm with the configured execution deadline.
    pub fn plugin_spec(
        &self,
        name: impl Into<String>,
        algorithm: impl CustomAlgorithm,
    ) -> PluginSpec {
        PluginSpec::new(name, algorithm, self.plugin_max_execution())
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
