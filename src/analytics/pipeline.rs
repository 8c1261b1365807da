use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use futures::stream::{self, StreamExt};
use opencv::prelude::*;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::events::{zones_from_records, FrameInput, Zone, ZoneEventEngine};
use super::geometry::Mask;
use super::object::{Detector, DetectorError, ObjectDetector};
use super::render;
use super::window::TimeWindow;
use crate::config::{Config, ModelConfig};
use crate::notify::{self, Notifier};
use crate::registry::{CameraRecord, CameraRegistry, MaskInfo};
use crate::store::{camera_statuses, keys, FrameStore, StoreError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no frame available")]
    NoFrame,
    #[error("zone configuration unavailable")]
    NoZones,
    #[error("no detector loaded for model '{0}'")]
    UnknownModel(String),
    #[error("failed to encode annotated frame")]
    Encode,
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub cycle_interval: Duration,
    pub overlap_threshold: f64,
    pub dwell_retention: Duration,
    pub max_parallel_fetches: usize,
    pub fetch_timeout: Duration,
    pub annotated_dir: PathBuf,
    pub darken_outside_window: bool,
    pub jpeg_quality: i32,
    pub recipients: Vec<String>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cycle_interval: Duration::from_secs(config.engine.cycle_interval_secs.max(1)),
            overlap_threshold: config.engine.overlap_threshold,
            dwell_retention: Duration::from_secs(config.engine.dwell_retention_secs),
            max_parallel_fetches: config.engine.max_parallel_fetches.max(1),
            fetch_timeout: Duration::from_secs(config.engine.fetch_timeout_secs),
            annotated_dir: config.engine.annotated_dir.clone(),
            darken_outside_window: config.engine.darken_outside_window,
            jpeg_quality: config.capture.jpeg_quality,
            recipients: config.notify.recipients.clone(),
        }
    }
}

/// Loads one ONNX detector per configured model.
pub fn load_detectors(
    models: &[ModelConfig],
) -> Result<HashMap<String, Box<dyn Detector>>, DetectorError> {
    let mut detectors: HashMap<String, Box<dyn Detector>> = HashMap::new();
    for model in models {
        detectors.insert(model.name.clone(), Box::new(ObjectDetector::new(model)?));
    }
    Ok(detectors)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub processed: usize,
    pub failed: usize,
    pub fired: usize,
}

struct CameraInputs {
    camera: CameraRecord,
    frame: Option<Vec<u8>>,
    mask: Option<MaskInfo>,
    mask_image: Option<Vec<u8>>,
    window: TimeWindow,
}

struct CachedMaskImage {
    url: String,
    mask: Mask,
}

/// Periodic detection pass over every live camera.
pub struct EventPipeline {
    store: Arc<dyn FrameStore>,
    registry: Arc<dyn CameraRegistry>,
    detectors: HashMap<String, Box<dyn Detector>>,
    default_model: String,
    engine: ZoneEventEngine,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
    cameras: Vec<CameraRecord>,
    /// Last zone configuration fetched per camera.
    masks: HashMap<u64, MaskInfo>,
    mask_images: HashMap<u64, CachedMaskImage>,
}

impl EventPipeline {
    /// `default_model` serves cameras that do not name a recognition model.
    pub fn new(
        store: Arc<dyn FrameStore>,
        registry: Arc<dyn CameraRegistry>,
        detectors: HashMap<String, Box<dyn Detector>>,
        default_model: String,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        let engine = ZoneEventEngine::new(settings.overlap_threshold, settings.dwell_retention);
        Self {
            store,
            registry,
            detectors,
            default_model,
            engine,
            notifier,
            settings,
            cameras: Vec::new(),
            masks: HashMap::new(),
            mask_images: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            models = self.detectors.len(),
            interval = ?self.settings.cycle_interval,
            "event engine started"
        );
        let mut ticker = tokio::time::interval(self.settings.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle(Local::now()).await;
                    tracing::debug!(
                        processed = report.processed,
                        failed = report.failed,
                        fired = report.fired,
                        "engine cycle complete"
                    );
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("event engine stopped");
    }

    pub async fn run_cycle(&mut self, now: DateTime<Local>) -> CycleReport {
        self.refresh_cameras().await;

        let statuses = match camera_statuses(self.store.as_ref()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read camera statuses");
                return CycleReport::default();
            }
        };
        let live: Vec<CameraRecord> = self
            .cameras
            .iter()
            .filter(|c| statuses.get(&c.id).is_some_and(|h| h.status.is_alive()))
            .cloned()
            .collect();

        let this = &*self;
        let mut inputs: Vec<CameraInputs> = stream::iter(live)
            .map(|camera| this.fetch_inputs(camera))
            .buffer_unordered(this.settings.max_parallel_fetches)
            .collect()
            .await;
        inputs.sort_by_key(|i| i.camera.id);

        let mut report = CycleReport::default();
        for input in inputs {
            let camera_id = input.camera.id;
            match self.process_camera(input, now).await {
                Ok(fired) => {
                    report.processed += 1;
                    report.fired += fired;
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(camera_id, error = %e, "camera processing failed");
                }
            }
        }

        let evicted = self.engine.evict(now);
        if evicted > 0 {
            tracing::debug!(evicted, "evicted stale dwell keys");
        }
        report
    }

    async fn refresh_cameras(&mut self) {
        let t = self.settings.fetch_timeout;
        match tokio::time::timeout(t, self.registry.cameras()).await {
            Ok(Ok(cameras)) => {
                self.masks.retain(|id, _| cameras.iter().any(|c| c.id == *id));
                self.mask_images.retain(|id, _| cameras.iter().any(|c| c.id == *id));
                self.cameras = cameras;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, known = self.cameras.len(), "camera list unavailable, using last known")
            }
            Err(_) => {
                tracing::warn!(known = self.cameras.len(), "camera list timed out, using last known")
            }
        }
    }

    async fn fetch_inputs(&self, camera: CameraRecord) -> CameraInputs {
        let id = camera.id;
        let t = self.settings.fetch_timeout;
        let frame_key = keys::latest_frame(id);
        let (frame, mask, window) = tokio::join!(
            bounded(t, id, "frame", self.store.get(&frame_key)),
            bounded(t, id, "mask", self.registry.mask(id)),
            bounded(t, id, "time window", self.registry.time_interval(id)),
        );
        let cached = |url: &str| self.mask_images.get(&id).is_some_and(|c| c.url == url);
        let mask_image = match mask.as_ref().and_then(|m| m.image_url.as_deref()) {
            Some(url) if !url.is_empty() && !cached(url) => {
                bounded(t, id, "mask image", self.registry.download(url)).await
            }
            _ => None,
        };

        CameraInputs {
            camera,
            frame: frame.flatten(),
            mask,
            mask_image,
            window: window
                .map(|w| TimeWindow::from_record(&w))
                .unwrap_or_default(),
        }
    }

    async fn process_camera(
        &mut self,
        input: CameraInputs,
        now: DateTime<Local>,
    ) -> Result<usize, PipelineError> {
        let CameraInputs {
            camera,
            frame,
            mask: mask_info,
            mask_image,
            window,
        } = input;

        // a failed zone fetch reuses the last known zones
        let mask_info = match mask_info {
            Some(info) => {
                self.masks.insert(camera.id, info.clone());
                info
            }
            None => self
                .masks
                .get(&camera.id)
                .cloned()
                .ok_or(PipelineError::NoZones)?,
        };

        let bytes = frame.ok_or(PipelineError::NoFrame)?;
        let frame = render::decode_jpeg(&bytes)?;
        if frame.empty() {
            return Err(PipelineError::NoFrame);
        }
        let (width, height) = (frame.cols() as u32, frame.rows() as u32);

        let zones = zones_from_records(&mask_info.polygons_info);
        if let (Some(url), Some(image)) = (mask_info.image_url.as_ref(), mask_image) {
            match render::decode_mask(&image)? {
                Some(mask) => {
                    self.mask_images.insert(
                        camera.id,
                        CachedMaskImage {
                            url: url.clone(),
                            mask,
                        },
                    );
                }
                None => tracing::warn!(camera_id = camera.id, %url, "mask image could not be decoded"),
            }
        }
        let mask = self.region_mask(camera.id, &mask_info, &zones, width, height)?;

        let model = camera
            .recognition_model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let detector = self
            .detectors
            .get_mut(&model)
            .ok_or_else(|| PipelineError::UnknownModel(model.clone()))?;

        let detect_on = match &mask {
            Some(m) if !m.is_degenerate() => render::apply_mask(&frame, m)?,
            _ => frame.try_clone()?,
        };
        let detections = tokio::task::block_in_place(|| detector.detect(&detect_on))?;

        let outcome = self.engine.process_frame(FrameInput {
            camera_id: camera.id,
            detections: &detections,
            labels: detector.labels(),
            mask: mask.as_ref(),
            zones: &zones,
            window: &window,
            frame_width: width,
            frame_height: height,
            now,
        });

        let mut annotated = if !outcome.armed && self.settings.darken_outside_window {
            render::darken(&frame)?
        } else {
            frame
        };
        render::annotate(&mut annotated, &zones, &outcome.detections)?;
        let jpeg = render::encode_jpeg(&annotated, self.settings.jpeg_quality)
            .ok_or(PipelineError::Encode)?;
        self.store.set(&keys::boxed_image(camera.id), &jpeg).await?;

        if !outcome.fired.is_empty() {
            let image_path = save_annotated(&self.settings.annotated_dir, camera.id, &jpeg, now).await;
            let name = camera.display_name();
            for event in &outcome.fired {
                let message = notify::render_message(&name, event);
                notify::dispatch(
                    self.notifier.clone(),
                    notify::fan_out(&self.settings.recipients, &message, image_path.clone()),
                );
            }
        }
        Ok(outcome.fired.len())
    }

    /// Mask image when one is configured and cached, otherwise the zone polygons.
    fn region_mask(
        &self,
        camera_id: u64,
        info: &MaskInfo,
        zones: &[Zone],
        width: u32,
        height: u32,
    ) -> Result<Option<Mask>, PipelineError> {
        if let Some(url) = info.image_url.as_deref() {
            if let Some(cached) = self.mask_images.get(&camera_id).filter(|c| c.url == url) {
                return Ok(render::fit_mask(cached.mask.clone(), width, height)?);
            }
        }
        if zones.is_empty() {
            return Ok(None);
        }
        Ok(render::rasterize_mask(width, height, zones)?)
    }
}

async fn bounded<T, E, F>(timeout: Duration, camera_id: u64, what: &str, fut: F) -> Option<T>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(camera_id, error = %e, "failed to fetch {what}");
            None
        }
        Err(_) => {
            tracing::warn!(camera_id, "timed out fetching {what}");
            None
        }
    }
}

async fn save_annotated(
    dir: &Path,
    camera_id: u64,
    jpeg: &[u8],
    now: DateTime<Local>,
) -> Option<PathBuf> {
    let path = dir.join(format!("{camera_id}_{}.jpg", now.format("%Y%m%d%H%M%S%3f")));
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, jpeg).await
    }
    .await;
    match result {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(camera_id, path = %path.display(), error = %e, "failed to save annotated image");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::geometry::BoundingBox;
    use crate::analytics::object::{Detection, LabelMap};
    use crate::notify::{Notification, NotifyError};
    use crate::registry::{RegistryError, TimeIntervalRecord, ZoneRecord};
    use crate::store::{CameraStatus, MemoryStore};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use opencv::core::{Mat, Scalar, CV_8UC3};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeRegistry {
        cameras: Vec<CameraRecord>,
        fail: AtomicBool,
        mask_fail: AtomicBool,
        zones: Vec<ZoneRecord>,
    }

    #[async_trait]
    impl CameraRegistry for FakeRegistry {
        async fn cameras(&self) -> Result<Vec<CameraRecord>, RegistryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RegistryError::Status {
                    url: "/cameras/all".into(),
                    status: 503,
                });
            }
            Ok(self.cameras.clone())
        }

        async fn mask(&self, camera_id: u64) -> Result<MaskInfo, RegistryError> {
            if self.mask_fail.load(Ordering::SeqCst) {
                return Err(RegistryError::Status {
                    url: format!("/mask/{camera_id}"),
                    status: 504,
                });
            }
            Ok(MaskInfo {
                image_url: None,
                polygons_info: self.zones.clone(),
            })
        }

        async fn time_interval(&self, _camera_id: u64) -> Result<TimeIntervalRecord, RegistryError> {
            Ok(TimeIntervalRecord::default())
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>, RegistryError> {
            Err(RegistryError::Status {
                url: url.into(),
                status: 404,
            })
        }
    }

    struct FixedDetector {
        labels: LabelMap,
        detections: Vec<Detection>,
    }

    impl Detector for FixedDetector {
        fn detect(&mut self, _frame: &Mat) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.detections.clone())
        }

        fn labels(&self) -> &LabelMap {
            &self.labels
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<Notification>>);

    #[async_trait]
    impl Notifier for Recording {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn camera(id: u64) -> CameraRecord {
        CameraRecord {
            id,
            stream_url: format!("rtsp://cam{id}"),
            name: Some(format!("Dock {id}")),
            recognition_model: None,
        }
    }

    fn settings(dir: PathBuf) -> EngineSettings {
        let mut config = Config::default();
        config.engine.annotated_dir = dir;
        EngineSettings::from_config(&config)
    }

    async fn seed_frame(store: &MemoryStore, camera_id: u64, alive: bool) {
        let frame = Mat::new_rows_cols_with_default(120, 160, CV_8UC3, Scalar::all(90.0)).unwrap();
        let jpeg = render::encode_jpeg(&frame, 90).unwrap();
        store.set(&keys::latest_frame(camera_id), &jpeg).await.unwrap();
        let status = if alive { CameraStatus::Alive } else { CameraStatus::Dead };
        store
            .set(&keys::status(camera_id), status.as_wire().as_bytes())
            .await
            .unwrap();
    }

    fn pipeline(
        store: &MemoryStore,
        registry: Arc<FakeRegistry>,
        notifier: Arc<Recording>,
        dir: PathBuf,
    ) -> EventPipeline {
        let detector = FixedDetector {
            labels: LabelMap::coco(),
            detections: vec![Detection {
                bbox: BoundingBox::new(20.0, 20.0, 60.0, 80.0),
                class_id: 0,
                confidence: 0.9,
            }],
        };
        let mut detectors: HashMap<String, Box<dyn Detector>> = HashMap::new();
        detectors.insert("default".into(), Box::new(detector));
        EventPipeline::new(
            Arc::new(store.clone()),
            registry,
            detectors,
            "default".into(),
            notifier,
            settings(dir),
        )
    }

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("visionflow-{name}-{}", std::process::id()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cycle_annotates_and_fires() {
        let store = MemoryStore::new();
        seed_frame(&store, 1, true).await;
        seed_frame(&store, 2, false).await;
        let registry = Arc::new(FakeRegistry {
            cameras: vec![camera(1), camera(2)],
            fail: AtomicBool::new(false),
            mask_fail: AtomicBool::new(false),
            zones: vec![ZoneRecord {
                name: "DockA".into(),
                points: vec![[0.0, 0.0], [100.0, 0.0], [100.0, 120.0], [0.0, 120.0]],
                color: None,
                duration: 1,
            }],
        });
        let notifier = Arc::new(Recording::default());
        let dir = scratch_dir("fires");
        let mut pipeline = pipeline(&store, registry, notifier.clone(), dir.clone());

        let t0 = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let first = pipeline.run_cycle(t0).await;
        assert_eq!(first, CycleReport { processed: 1, failed: 0, fired: 0 });
        assert!(store.get(&keys::boxed_image(1)).await.unwrap().is_some());
        assert!(store.get(&keys::boxed_image(2)).await.unwrap().is_none());

        let second = pipeline.run_cycle(t0 + ChronoDuration::seconds(61)).await;
        assert_eq!(second.fired, 1);
        let third = pipeline.run_cycle(t0 + ChronoDuration::seconds(62)).await;
        assert_eq!(third.fired, 0);

        for _ in 0..50 {
            if !notifier.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = notifier.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].message.starts_with("Dock 1: person inside DockA"));
        let saved = sent[0].image_path.clone().unwrap();
        assert!(saved.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registry_outage_keeps_last_known_cameras() {
        let store = MemoryStore::new();
        seed_frame(&store, 1, true).await;
        let registry = Arc::new(FakeRegistry {
            cameras: vec![camera(1)],
            fail: AtomicBool::new(false),
            mask_fail: AtomicBool::new(false),
            zones: Vec::new(),
        });
        let notifier = Arc::new(Recording::default());
        let mut pipeline = pipeline(&store, registry.clone(), notifier, scratch_dir("outage"));

        let now = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(pipeline.run_cycle(now).await.processed, 1);
        registry.fail.store(true, Ordering::SeqCst);
        assert_eq!(pipeline.run_cycle(now).await.processed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_model_is_isolated_per_camera() {
        let store = MemoryStore::new();
        seed_frame(&store, 1, true).await;
        seed_frame(&store, 2, true).await;
        let mut odd = camera(2);
        odd.recognition_model = Some("missing".into());
        let registry = Arc::new(FakeRegistry {
            cameras: vec![camera(1), odd],
            fail: AtomicBool::new(false),
            mask_fail: AtomicBool::new(false),
            zones: Vec::new(),
        });
        let notifier = Arc::new(Recording::default());
        let mut pipeline = pipeline(&store, registry, notifier, scratch_dir("model"));

        let now = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let report = pipeline.run_cycle(now).await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
    }

    fn dock_zone(duration: i64) -> ZoneRecord {
        ZoneRecord {
            name: "DockA".into(),
            points: vec![[0.0, 0.0], [100.0, 0.0], [100.0, 120.0], [0.0, 120.0]],
            color: None,
            duration,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zone_outage_keeps_dwell_episode() {
        let store = MemoryStore::new();
        seed_frame(&store, 1, true).await;
        let registry = Arc::new(FakeRegistry {
            cameras: vec![camera(1)],
            fail: AtomicBool::new(false),
            mask_fail: AtomicBool::new(false),
            zones: vec![dock_zone(2)],
        });
        let notifier = Arc::new(Recording::default());
        let dir = scratch_dir("zone-outage");
        let mut pipeline = pipeline(&store, registry.clone(), notifier, dir.clone());
        let dock = crate::analytics::DwellKey::new(1, "person", &["DockA"]);
        let unzoned = crate::analytics::DwellKey::new::<&str>(1, "person", &[]);

        let t0 = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(pipeline.run_cycle(t0).await.fired, 0);

        registry.mask_fail.store(true, Ordering::SeqCst);
        let during = pipeline.run_cycle(t0 + ChronoDuration::seconds(61)).await;
        assert_eq!(during.processed, 1);
        let event = pipeline.engine.tracker().get(&dock).unwrap();
        assert_eq!(event.state, crate::analytics::DwellState::Inside);
        assert_eq!(event.start, t0);
        assert!(pipeline.engine.tracker().get(&unzoned).is_none());

        registry.mask_fail.store(false, Ordering::SeqCst);
        let after = pipeline.run_cycle(t0 + ChronoDuration::seconds(121)).await;
        assert_eq!(after.fired, 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_camera_without_known_zones_is_skipped() {
        let store = MemoryStore::new();
        seed_frame(&store, 1, true).await;
        let registry = Arc::new(FakeRegistry {
            cameras: vec![camera(1)],
            fail: AtomicBool::new(false),
            mask_fail: AtomicBool::new(true),
            zones: vec![dock_zone(0)],
        });
        let notifier = Arc::new(Recording::default());
        let mut pipeline = pipeline(&store, registry, notifier, scratch_dir("no-zones"));

        let now = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let report = pipeline.run_cycle(now).await;
        assert_eq!(report, CycleReport { processed: 0, failed: 1, fired: 0 });
        assert!(pipeline.engine.tracker().is_empty());
        assert!(store.get(&keys::boxed_image(1)).await.unwrap().is_none());
    }
}
