use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{
    CameraList, CameraRecord, CameraRegistry, MaskInfo, RegistryError, TimeIntervalRecord,
};

pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
    zone_url: String,
}

impl HttpRegistry {
    /// `zone_url` serves `/mask/{id}` and `/time_intervals/{id}`; it defaults to `base_url`.
    pub fn new(
        base_url: &str,
        zone_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("visionflow/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let zone_url = zone_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| base_url.clone());
        Ok(Self {
            client,
            base_url,
            zone_url,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, RegistryError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl CameraRegistry for HttpRegistry {
    async fn cameras(&self) -> Result<Vec<CameraRecord>, RegistryError> {
        let url = format!("{}/cameras/all", self.base_url);
        let list: CameraList = self.get_json(&url).await?;
        Ok(list.into_records())
    }

    async fn mask(&self, camera_id: u64) -> Result<MaskInfo, RegistryError> {
        let url = format!("{}/mask/{}", self.zone_url, camera_id);
        self.get_json(&url).await
    }

    async fn time_interval(&self, camera_id: u64) -> Result<TimeIntervalRecord, RegistryError> {
        let url = format!("{}/time_intervals/{}", self.zone_url, camera_id);
        self.get_json(&url).await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, RegistryError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
