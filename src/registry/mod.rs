//! Camera registry collaborator: camera list, zone/mask config and arming windows.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

mod http;

pub use http::HttpRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraRecord {
    pub id: u64,
    pub stream_url: String,
    pub name: Option<String>,
    pub recognition_model: Option<String>,
}

impl CameraRecord {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Camera {}", self.id))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawCamera {
    id: u64,
    #[serde(default)]
    stream_url: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "recognition")]
    recognition_model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum CameraList {
    Bare(Vec<RawCamera>),
    Wrapped { data: Vec<RawCamera> },
}

impl CameraList {
    /// Cameras without a stream URL cannot be captured and are left out.
    pub(crate) fn into_records(self) -> Vec<CameraRecord> {
        let raw = match self {
            CameraList::Bare(list) => list,
            CameraList::Wrapped { data } => data,
        };
        raw.into_iter()
            .filter_map(|c| {
                let stream_url = c.stream_url.filter(|u| !u.trim().is_empty())?;
                Some(CameraRecord {
                    id: c.id,
                    stream_url,
                    name: c.name,
                    recognition_model: c.recognition_model,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ZoneRecord {
    pub name: String,
    pub points: Vec<[f64; 2]>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub duration: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MaskInfo {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub polygons_info: Vec<ZoneRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeIntervalRecord {
    #[serde(default = "default_start")]
    pub start_time: String,
    #[serde(default = "default_end")]
    pub end_time: String,
}

fn default_start() -> String {
    "00:00".to_string()
}

fn default_end() -> String {
    "23:59".to_string()
}

impl Default for TimeIntervalRecord {
    fn default() -> Self {
        Self {
            start_time: default_start(),
            end_time: default_end(),
        }
    }
}

#[async_trait]
pub trait CameraRegistry: Send + Sync {
    async fn cameras(&self) -> Result<Vec<CameraRecord>, RegistryError>;

    async fn mask(&self, camera_id: u64) -> Result<MaskInfo, RegistryError>;

    async fn time_interval(&self, camera_id: u64) -> Result<TimeIntervalRecord, RegistryError>;

    /// Fetches a binary resource such as a mask image.
    async fn download(&self, url: &str) -> Result<Vec<u8>, RegistryError>;
}
