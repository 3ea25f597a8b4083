//! Configuration entity, defaults, and the process-global config snapshot.
//!
//! File/environment loading is the host application's concern; the core
//! consumes a validated [`Config`] installed via [`init_with_config`].

use std::sync::OnceLock;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock;
use crate::error::FloodgateError;
use crate::stat::check_validity_for_reuse_statistic;

/// Reserved resource name of the inbound aggregate node.
pub const TOTAL_INBOUND_RESOURCE_NAME: &str = "__total_inbound_traffic__";

/// Soft cap on distinct resources before the registry starts warning.
pub const DEFAULT_MAX_RESOURCE_AMOUNT: usize = 10_000;

/// Default read-only metric window: 2 buckets over 1 s (500 ms each).
pub const DEFAULT_SAMPLE_COUNT: u32 = 2;
pub const DEFAULT_INTERVAL_MS: u32 = 1_000;

/// Default per-resource global statistic: 20 buckets over 10 s.
pub const DEFAULT_SAMPLE_COUNT_TOTAL: u32 = 20;
pub const DEFAULT_INTERVAL_MS_TOTAL: u32 = 10_000;

/// Initial min-RT of a fresh bucket, also the "no data" RT ceiling.
pub const DEFAULT_STATISTIC_MAX_RT: i64 = 60_000;

pub const DEFAULT_WARM_UP_COLD_FACTOR: u32 = 3;

pub const DEFAULT_METRIC_LOG_SINGLE_FILE_MAX_SIZE: u64 = 1024 * 1024 * 50;
pub const DEFAULT_METRIC_LOG_MAX_FILE_AMOUNT: u32 = 8;
pub const DEFAULT_METRIC_LOG_FLUSH_INTERVAL_SEC: u32 = 1;

pub const DEFAULT_SYSTEM_STAT_COLLECT_INTERVAL_MS: u32 = 1_000;
pub const DEFAULT_LOAD_STAT_COLLECT_INTERVAL_MS: u32 = 1_000;
pub const DEFAULT_CPU_STAT_COLLECT_INTERVAL_MS: u32 = 1_000;
pub const DEFAULT_MEMORY_STAT_COLLECT_INTERVAL_MS: u32 = 150;

const UNKNOWN_APP_NAME: &str = "unknown_service";

/// Top-level configuration entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub version: String,
    pub app: AppConfig,
    pub log: LogConfig,
    pub stat: StatConfig,
    pub exporter: ExporterConfig,
    pub use_cache_time: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    /// Name of the running service.
    pub name: String,
    /// Service classification (e.g. web service, API gateway).
    pub app_type: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    pub dir: String,
    /// Whether log file names end with the process id.
    pub use_pid: bool,
    pub metric: MetricLogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricLogConfig {
    pub single_file_max_size: u64,
    pub max_file_count: u32,
    pub flush_interval_sec: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatConfig {
    /// Per-resource global sliding-window shape.
    pub global_statistic_sample_count_total: u32,
    pub global_statistic_interval_ms_total: u32,
    /// Default read-only window shape; must be reusable over the global one.
    pub metric_statistic_sample_count: u32,
    pub metric_statistic_interval_ms: u32,
    pub system: SystemStatConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SystemStatConfig {
    pub collect_interval_ms: u32,
    pub collect_load_interval_ms: u32,
    pub collect_cpu_interval_ms: u32,
    pub collect_memory_interval_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExporterConfig {
    pub metric: MetricExporterConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricExporterConfig {
    /// HTTP listen address of the metric endpoint, e.g. ":8080".
    pub http_addr: String,
    /// HTTP request path of the metric endpoint, e.g. "/metrics".
    pub http_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "v1".into(),
            app: AppConfig::default(),
            log: LogConfig::default(),
            stat: StatConfig::default(),
            exporter: ExporterConfig::default(),
            use_cache_time: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { name: UNKNOWN_APP_NAME.into(), app_type: 0 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { dir: String::new(), use_pid: false, metric: MetricLogConfig::default() }
    }
}

impl Default for MetricLogConfig {
    fn default() -> Self {
        Self {
            single_file_max_size: DEFAULT_METRIC_LOG_SINGLE_FILE_MAX_SIZE,
            max_file_count: DEFAULT_METRIC_LOG_MAX_FILE_AMOUNT,
            flush_interval_sec: DEFAULT_METRIC_LOG_FLUSH_INTERVAL_SEC,
        }
    }
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            global_statistic_sample_count_total: DEFAULT_SAMPLE_COUNT_TOTAL,
            global_statistic_interval_ms_total: DEFAULT_INTERVAL_MS_TOTAL,
            metric_statistic_sample_count: DEFAULT_SAMPLE_COUNT,
            metric_statistic_interval_ms: DEFAULT_INTERVAL_MS,
            system: SystemStatConfig::default(),
        }
    }
}

impl Default for SystemStatConfig {
    fn default() -> Self {
        Self {
            collect_interval_ms: DEFAULT_SYSTEM_STAT_COLLECT_INTERVAL_MS,
            collect_load_interval_ms: DEFAULT_LOAD_STAT_COLLECT_INTERVAL_MS,
            collect_cpu_interval_ms: DEFAULT_CPU_STAT_COLLECT_INTERVAL_MS,
            collect_memory_interval_ms: DEFAULT_MEMORY_STAT_COLLECT_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Validate the entity before installation.
    pub fn check_valid(&self) -> Result<(), FloodgateError> {
        if self.version.is_empty() {
            return Err(FloodgateError::invalid_rule("empty config version"));
        }
        if self.app.name.is_empty() {
            return Err(FloodgateError::invalid_rule("empty app name"));
        }
        check_validity_for_reuse_statistic(
            self.stat.metric_statistic_sample_count,
            self.stat.metric_statistic_interval_ms,
            self.stat.global_statistic_sample_count_total,
            self.stat.global_statistic_interval_ms_total,
        )
    }
}

static GLOBAL_CONFIG: OnceLock<ArcSwap<Config>> = OnceLock::new();

fn global_config() -> &'static ArcSwap<Config> {
    GLOBAL_CONFIG.get_or_init(|| ArcSwap::from_pointee(Config::default()))
}

/// Install a validated configuration and start the optional background
/// components it enables (currently the cached-time ticker).
pub fn init_with_config(config: Config) -> Result<(), FloodgateError> {
    config.check_valid()?;
    let use_cache_time = config.use_cache_time;
    global_config().store(Arc::new(config));
    if use_cache_time {
        clock::start_time_ticker();
    }
    Ok(())
}

/// Install the default configuration.
pub fn init_default() -> Result<(), FloodgateError> {
    init_with_config(Config::default())
}

/// Snapshot the current configuration.
pub fn current_config() -> Arc<Config> {
    global_config().load_full()
}

pub fn global_statistic_sample_count_total() -> u32 {
    global_config().load().stat.global_statistic_sample_count_total
}

pub fn global_statistic_interval_ms_total() -> u32 {
    global_config().load().stat.global_statistic_interval_ms_total
}

pub fn global_statistic_bucket_length_ms() -> u32 {
    let cfg = global_config().load();
    let stat = &cfg.stat;
    stat.global_statistic_interval_ms_total / stat.global_statistic_sample_count_total.max(1)
}

pub fn metric_statistic_sample_count() -> u32 {
    global_config().load().stat.metric_statistic_sample_count
}

pub fn metric_statistic_interval_ms() -> u32 {
    global_config().load().stat.metric_statistic_interval_ms
}

pub fn metric_log_flush_interval_sec() -> u32 {
    global_config().load().log.metric.flush_interval_sec
}

pub fn metric_log_single_file_max_size() -> u64 {
    global_config().load().log.metric.single_file_max_size
}

pub fn metric_log_max_file_amount() -> u32 {
    global_config().load().log.metric.max_file_count
}

pub fn app_name() -> String {
    global_config().load().app.name.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().check_valid().is_ok());
    }

    #[test]
    fn invalid_metric_window_is_rejected() {
        let mut cfg = Config::default();
        cfg.stat.metric_statistic_sample_count = 3;
        cfg.stat.metric_statistic_interval_ms = 1000;
        assert!(cfg.check_valid().is_err());
    }

    #[test]
    fn empty_app_name_is_rejected() {
        let mut cfg = Config::default();
        cfg.app.name.clear();
        let err = cfg.check_valid().unwrap_err();
        assert!(err.is_invalid_rule());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = Config::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let parsed: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"useCacheTime":true}"#).unwrap();
        assert!(parsed.use_cache_time);
        assert_eq!(parsed.stat.metric_statistic_sample_count, DEFAULT_SAMPLE_COUNT);
    }
}
