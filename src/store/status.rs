use std::collections::BTreeMap;

use super::{keys, FrameStore, StoreError};

/// Liveness of a camera's capture. Stored as `"True"`/`"False"` for the other services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraStatus {
    Alive,
    Dead,
}

impl CameraStatus {
    pub fn as_wire(self) -> &'static str {
        match self {
            CameraStatus::Alive => "True",
            CameraStatus::Dead => "False",
        }
    }

    pub fn from_wire(value: &str) -> Self {
        if value.trim() == "True" {
            CameraStatus::Alive
        } else {
            CameraStatus::Dead
        }
    }

    pub fn is_alive(self) -> bool {
        self == CameraStatus::Alive
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraHealth {
    pub status: CameraStatus,
    pub last_timestamp: Option<String>,
}

/// Reads every `camera_{id}_status` key along with its last frame timestamp.
pub async fn camera_statuses(
    store: &dyn FrameStore,
) -> Result<BTreeMap<u64, CameraHealth>, StoreError> {
    let mut statuses = BTreeMap::new();
    for key in store.scan_prefix(keys::CAMERA_PREFIX).await? {
        if !key.ends_with("_status") {
            continue;
        }
        let Some(camera_id) = keys::camera_id_of(&key) else {
            continue;
        };
        if key != keys::status(camera_id) {
            continue;
        }
        let status = store
            .get_string(&key)
            .await?
            .map(|v| CameraStatus::from_wire(&v))
            .unwrap_or(CameraStatus::Dead);
        let last_timestamp = store.get_string(&keys::last_timestamp(camera_id)).await?;
        statuses.insert(
            camera_id,
            CameraHealth {
                status,
                last_timestamp,
            },
        );
    }
    Ok(statuses)
}
