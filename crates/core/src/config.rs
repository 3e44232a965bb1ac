use serde::Deserialize;
use std::path::Path;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CAMPAIGN_DISPATCH__` layered over an optional TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub send_time: SendTimeConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_delay_between_batches_ms")]
    pub delay_between_batches_ms: u64,
}

/// Options applied to one named queue when jobs are added to it.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueJobConfig {
    /// Lower runs first.
    pub priority: u32,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_import_job")]
    pub import: QueueJobConfig,
    #[serde(default = "default_validation_job")]
    pub validation: QueueJobConfig,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_cleanup_grace_secs")]
    pub cleanup_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendTimeConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_min_data_points")]
    pub min_data_points: usize,
    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,
    #[serde(default = "default_full_confidence_points")]
    pub full_confidence_points: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "dispatch-01".to_string()
}
fn default_scheduler_enabled() -> bool {
    true
}
fn default_tick_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    100
}
fn default_max_concurrency() -> usize {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_delay_between_batches_ms() -> u64 {
    100
}
fn default_import_job() -> QueueJobConfig {
    QueueJobConfig {
        priority: 1,
        attempts: 3,
        backoff_ms: 2000,
        remove_on_complete: Some(10),
        remove_on_fail: Some(50),
        timeout_ms: Some(30 * 60 * 1000),
    }
}
fn default_validation_job() -> QueueJobConfig {
    QueueJobConfig {
        priority: 2,
        attempts: 2,
        backoff_ms: 5000,
        remove_on_complete: Some(10),
        remove_on_fail: Some(50),
        timeout_ms: Some(10 * 60 * 1000),
    }
}
fn default_worker_concurrency() -> usize {
    2
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_cleanup_grace_secs() -> u64 {
    24 * 3600
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_history_limit() -> usize {
    100
}
fn default_min_data_points() -> usize {
    5
}
fn default_fallback_confidence() -> f64 {
    0.3
}
fn default_full_confidence_points() -> usize {
    20
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            delay_between_batches_ms: default_delay_between_batches_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            import: default_import_job(),
            validation: default_validation_job(),
            worker_concurrency: default_worker_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            cleanup_grace_secs: default_cleanup_grace_secs(),
        }
    }
}

impl Default for SendTimeConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            min_data_points: default_min_data_points(),
            fallback_confidence: default_fallback_confidence(),
            full_confidence_points: default_full_confidence_points(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            batch: BatchConfig::default(),
            queue: QueueConfig::default(),
            send_time: SendTimeConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file overlaid by environment variables.
    pub fn load_from(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("CAMPAIGN_DISPATCH")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()?;
        config.try_deserialize()
    }
}
