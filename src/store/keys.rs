//! Key and channel names shared with the other services.

pub const CAMERA_PREFIX: &str = "camera_";

pub fn latest_frame(camera_id: u64) -> String {
    format!("camera_{camera_id}_latest_frame")
}

pub fn boxed_image(camera_id: u64) -> String {
    format!("camera_{camera_id}_boxed_image")
}

pub fn status(camera_id: u64) -> String {
    format!("camera_{camera_id}_status")
}

pub fn last_timestamp(camera_id: u64) -> String {
    format!("camera_{camera_id}_last_timestamp")
}

pub fn fps(camera_id: u64) -> String {
    format!("camera_{camera_id}_fps")
}

pub fn latest_frame_path(camera_id: u64) -> String {
    format!("camera_{camera_id}_latest_frame_path")
}

pub fn url(camera_id: u64) -> String {
    format!("camera_{camera_id}_url")
}

pub fn worker_urls(worker_id: u32) -> String {
    format!("worker_{worker_id}_urls")
}

pub fn worker_update_channel(worker_id: u32) -> String {
    format!("worker_{worker_id}_urls_update")
}

/// Extracts the camera id from any `camera_{id}_*` key.
pub fn camera_id_of(key: &str) -> Option<u64> {
    key.strip_prefix(CAMERA_PREFIX)?
        .split('_')
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(latest_frame(7), "camera_7_latest_frame");
        assert_eq!(boxed_image(7), "camera_7_boxed_image");
        assert_eq!(worker_urls(2), "worker_2_urls");
        assert_eq!(worker_update_channel(2), "worker_2_urls_update");
    }

    #[test]
    fn test_camera_id_of() {
        assert_eq!(camera_id_of("camera_12_status"), Some(12));
        assert_eq!(camera_id_of("camera_3_latest_frame_path"), Some(3));
        assert_eq!(camera_id_of("camera_x_status"), None);
        assert_eq!(camera_id_of("worker_1_urls"), None);
    }
}
