use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("WORKER_ID is not set")]
    MissingWorkerId,
    #[error("WORKER_ID {value:?} is not a worker in 1..={count}")]
    InvalidWorkerId { value: String, count: u32 },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
}

fn default_store_url() -> String {
    "redis://redis:6379/0".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub base_url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub zone_url: Option<String>,
}

fn default_registry_url() -> String {
    "http://backend:5000".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_registry_timeout() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            poll_interval_secs: default_poll_interval(),
            timeout_secs: default_registry_timeout(),
            zone_url: None,
        }
    }
}

impl RegistryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: u32,
}

fn default_worker_count() -> u32 {
    3
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_read_retry_ms")]
    pub read_retry_ms: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    #[serde(default = "default_probe_retry_delay")]
    pub probe_retry_delay_secs: u64,
    #[serde(default = "default_pipeline_error_limit")]
    pub pipeline_error_limit: u32,
    #[serde(default = "default_sample_fps")]
    pub sample_fps: u32,
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default = "default_max_concurrent_cameras")]
    pub max_concurrent_cameras: usize,
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: i32,
}

fn default_max_failures() -> u32 {
    10
}

fn default_read_retry_ms() -> u64 {
    1000
}

fn default_reconnect_interval() -> u64 {
    30
}

fn default_probe_retries() -> u32 {
    3
}

fn default_probe_retry_delay() -> u64 {
    2
}

fn default_pipeline_error_limit() -> u32 {
    3
}

fn default_sample_fps() -> u32 {
    1
}

fn default_snapshot_every() -> u64 {
    100
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("frames")
}

fn default_max_concurrent_cameras() -> usize {
    10
}

fn default_liveness_interval() -> u64 {
    5
}

fn default_jpeg_quality() -> i32 {
    85
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            read_retry_ms: default_read_retry_ms(),
            reconnect_interval_secs: default_reconnect_interval(),
            probe_retries: default_probe_retries(),
            probe_retry_delay_secs: default_probe_retry_delay(),
            pipeline_error_limit: default_pipeline_error_limit(),
            sample_fps: default_sample_fps(),
            snapshot_every: default_snapshot_every(),
            snapshot_dir: default_snapshot_dir(),
            max_concurrent_cameras: default_max_concurrent_cameras(),
            liveness_interval_secs: default_liveness_interval(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: f64,
    #[serde(default = "default_max_parallel_fetches")]
    pub max_parallel_fetches: usize,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_dwell_retention")]
    pub dwell_retention_secs: u64,
    #[serde(default = "default_annotated_dir")]
    pub annotated_dir: PathBuf,
    #[serde(default = "default_true")]
    pub darken_outside_window: bool,
}

fn default_cycle_interval() -> u64 {
    2
}

fn default_overlap_threshold() -> f64 {
    0.5
}

fn default_max_parallel_fetches() -> usize {
    8
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_dwell_retention() -> u64 {
    3600
}

fn default_annotated_dir() -> PathBuf {
    PathBuf::from("saved_images/annotated_images")
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            overlap_threshold: default_overlap_threshold(),
            max_parallel_fetches: default_max_parallel_fetches(),
            fetch_timeout_secs: default_fetch_timeout(),
            dwell_retention_secs: default_dwell_retention(),
            annotated_dir: default_annotated_dir(),
            darken_outside_window: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_iou")]
    pub iou: f32,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

fn default_confidence() -> f32 {
    0.5
}

fn default_iou() -> f32 {
    0.45
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

fn default_notify_timeout() -> u64 {
    10
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            recipients: Vec::new(),
            timeout_secs: default_notify_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Reads the file if it exists, then applies environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(count) = lookup("NUM_WORKERS") {
            self.workers.count = count
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("NUM_WORKERS {count:?} is not a number")))?;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.store.url = url;
        }
        if let Some(url) = lookup("REGISTRY_URL") {
            self.registry.base_url = url;
        }
        if let Some(url) = lookup("ZONE_SERVICE_URL") {
            self.registry.zone_url = Some(url);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.count == 0 {
            return Err(ConfigError::Invalid("workers.count must be at least 1".into()));
        }
        if !(self.engine.overlap_threshold > 0.0 && self.engine.overlap_threshold <= 1.0) {
            return Err(ConfigError::Invalid(
                "engine.overlap_threshold must be in (0, 1]".into(),
            ));
        }
        if self.capture.max_failures == 0 {
            return Err(ConfigError::Invalid("capture.max_failures must be at least 1".into()));
        }
        if self.capture.max_concurrent_cameras == 0 {
            return Err(ConfigError::Invalid(
                "capture.max_concurrent_cameras must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolves this process's worker id from `WORKER_ID`.
    pub fn worker_id(&self) -> Result<u32, ConfigError> {
        parse_worker_id(std::env::var("WORKER_ID").ok(), self.workers.count)
    }
}

fn parse_worker_id(value: Option<String>, count: u32) -> Result<u32, ConfigError> {
    let value = value.ok_or(ConfigError::MissingWorkerId)?;
    match value.trim().parse::<u32>() {
        Ok(id) if (1..=count).contains(&id) => Ok(id),
        _ => Err(ConfigError::InvalidWorkerId { value, count }),
    }
}
