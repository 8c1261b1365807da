//! Capture workers: per-camera decode loops and the supervisor that keeps them
//! matched to this worker's assignment.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::CaptureConfig;
use crate::store::StoreError;

mod source;
mod supervisor;
mod task;

pub use source::StreamOpener;
pub use supervisor::CaptureSupervisor;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg not found")]
    FfmpegNotFound,
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub max_failures: u32,
    pub read_retry: Duration,
    pub reconnect_interval: Duration,
    pub probe_retries: u32,
    pub probe_retry_delay: Duration,
    pub pipeline_error_limit: u32,
    pub snapshot_every: u64,
    /// `None` disables snapshots.
    pub snapshot_dir: Option<PathBuf>,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            max_failures: config.max_failures.max(1),
            read_retry: Duration::from_millis(config.read_retry_ms),
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs),
            probe_retries: config.probe_retries,
            probe_retry_delay: Duration::from_secs(config.probe_retry_delay_secs),
            pipeline_error_limit: config.pipeline_error_limit.max(1),
            snapshot_every: config.snapshot_every,
            snapshot_dir: (!config.snapshot_dir.as_os_str().is_empty())
                .then(|| config.snapshot_dir.clone()),
        }
    }
}
