//! One camera's capture loop: probe, open, read, publish, reconnect.
//!
//! Runs on a blocking thread. Store writes go through the runtime handle, and
//! every wait polls the stop flag so teardown is prompt.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

use super::source::{
    CapturedFrame, DecodeStrategy, FrameSource, ReadOutcome, Resolution, SourceOpener,
};
use super::{CaptureError, CaptureSettings};
use crate::store::{keys, CameraStatus, FrameStore, StoreError};

const STOP_POLL: Duration = Duration::from_millis(50);
const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Connecting,
    Streaming,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureExit {
    Stopped,
    /// Consecutive failures reached the limit.
    Exhausted { failures: u32 },
    /// The direct reader also failed after the pipeline was abandoned.
    FallbackExhausted { failures: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReport {
    pub camera_id: u64,
    pub generation: u64,
    pub state: CaptureState,
    pub failures: u32,
    pub fps: Option<f64>,
    pub last_frame_at: Option<DateTime<Local>>,
}

/// Publishes one camera's frames and liveness keys.
pub struct FrameSink {
    store: Arc<dyn FrameStore>,
    runtime: Handle,
    camera_id: u64,
    url: String,
}

impl FrameSink {
    pub fn new(store: Arc<dyn FrameStore>, runtime: Handle, camera_id: u64, url: &str) -> Self {
        Self {
            store,
            runtime,
            camera_id,
            url: url.to_string(),
        }
    }

    fn publish_frame(&self, frame: &CapturedFrame) -> Result<(), StoreError> {
        let id = self.camera_id;
        let timestamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        self.runtime.block_on(async {
            self.store.set(&keys::latest_frame(id), &frame.jpeg).await?;
            self.store
                .set(&keys::status(id), CameraStatus::Alive.as_wire().as_bytes())
                .await?;
            self.store
                .set(&keys::last_timestamp(id), timestamp.as_bytes())
                .await?;
            self.store.set(&keys::url(id), self.url.as_bytes()).await
        })
    }

    fn publish_fps(&self, fps: f64) -> Result<(), StoreError> {
        let value = format!("{fps:.2}");
        self.runtime
            .block_on(self.store.set(&keys::fps(self.camera_id), value.as_bytes()))
    }

    fn mark_dead(&self) {
        let key = keys::status(self.camera_id);
        let result = self
            .runtime
            .block_on(self.store.set(&key, CameraStatus::Dead.as_wire().as_bytes()));
        if let Err(e) = result {
            tracing::warn!(camera_id = self.camera_id, error = %e, "failed to mark camera dead");
        }
    }

    /// Writes `{dir}/{id}/{YYYYMMDD}/{HH}/{ts}.jpg` and deletes the previous one,
    /// so at most one snapshot per camera is on disk.
    fn rotate_snapshot(&self, dir: &Path, frame: &CapturedFrame) -> Result<PathBuf, CaptureError> {
        let now = Local::now();
        let folder = dir
            .join(self.camera_id.to_string())
            .join(now.format("%Y%m%d").to_string())
            .join(now.format("%H").to_string());
        std::fs::create_dir_all(&folder)?;
        let path = folder.join(format!("{}.jpg", now.format("%Y%m%d%H%M%S%3f")));
        std::fs::write(&path, &frame.jpeg)?;

        let key = keys::latest_frame_path(self.camera_id);
        let previous = self.runtime.block_on(self.store.get_string(&key))?;
        if let Some(previous) = previous.filter(|p| Path::new(p) != path) {
            if let Err(e) = std::fs::remove_file(&previous) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(camera_id = self.camera_id, path = %previous, error = %e, "failed to delete old snapshot");
                }
            }
        }
        let written = path.to_string_lossy().into_owned();
        self.runtime.block_on(self.store.set(&key, written.as_bytes()))?;
        Ok(path)
    }
}

struct FpsMeter {
    window_start: Instant,
    frames: u32,
}

impl FpsMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
        }
    }

    /// Returns a rate once at least a full window has elapsed.
    fn tick(&mut self) -> Option<f64> {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < FPS_WINDOW {
            return None;
        }
        let fps = self.frames as f64 / elapsed.as_secs_f64();
        self.window_start = Instant::now();
        self.frames = 0;
        Some(fps)
    }
}

enum StreamEnd {
    Stopped,
    Reopen,
    Exhausted,
}

pub struct CaptureTask {
    camera_id: u64,
    generation: u64,
    url: String,
    settings: CaptureSettings,
    opener: Arc<dyn SourceOpener>,
    sink: FrameSink,
    reports: Option<UnboundedSender<CaptureReport>>,
    state: CaptureState,
    strategy: DecodeStrategy,
    failures: u32,
    pipeline_errors: u32,
    fell_back: bool,
    frames: u64,
    fps: Option<f64>,
    last_frame_at: Option<DateTime<Local>>,
}

impl CaptureTask {
    pub fn new(
        camera_id: u64,
        generation: u64,
        url: &str,
        settings: CaptureSettings,
        opener: Arc<dyn SourceOpener>,
        sink: FrameSink,
    ) -> Self {
        Self {
            camera_id,
            generation,
            url: url.to_string(),
            settings,
            opener,
            sink,
            reports: None,
            state: CaptureState::Connecting,
            strategy: DecodeStrategy::Direct,
            failures: 0,
            pipeline_errors: 0,
            fell_back: false,
            frames: 0,
            fps: None,
            last_frame_at: None,
        }
    }

    pub fn with_reports(mut self, reports: UnboundedSender<CaptureReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn run(mut self, stop: &AtomicBool) -> CaptureExit {
        tracing::info!(camera_id = self.camera_id, url = %self.url, "capture task started");
        self.report();

        let resolution = self.probe(stop);
        if resolution.is_none() && stop.load(Ordering::Relaxed) {
            return self.finish(CaptureExit::Stopped);
        }
        self.strategy = match resolution {
            Some(resolution) => DecodeStrategy::Pipeline(resolution),
            None => {
                tracing::warn!(camera_id = self.camera_id, "resolution probe failed, using direct reader");
                DecodeStrategy::Direct
            }
        };

        let exit = self.stream(stop);
        self.finish(exit)
    }

    fn finish(mut self, exit: CaptureExit) -> CaptureExit {
        if exit != CaptureExit::Stopped {
            self.sink.mark_dead();
            self.transition(CaptureState::Failed);
        }
        tracing::info!(camera_id = self.camera_id, ?exit, frames = self.frames, "capture task finished");
        exit
    }

    fn probe(&self, stop: &AtomicBool) -> Option<Resolution> {
        let attempts = self.settings.probe_retries.max(1);
        for attempt in 1..=attempts {
            match self.opener.probe(&self.url) {
                Ok(resolution) => {
                    tracing::debug!(camera_id = self.camera_id, ?resolution, "probed stream");
                    return Some(resolution);
                }
                Err(e) => {
                    tracing::warn!(camera_id = self.camera_id, attempt, error = %e, "probe failed");
                }
            }
            if attempt < attempts && !pause(self.settings.probe_retry_delay, stop) {
                return None;
            }
        }
        None
    }

    fn stream(&mut self, stop: &AtomicBool) -> CaptureExit {
        while !stop.load(Ordering::Relaxed) {
            let end = match self.opener.open(&self.url, self.strategy) {
                Ok(mut source) => {
                    tracing::info!(camera_id = self.camera_id, strategy = ?self.strategy, "stream opened");
                    self.read_loop(source.as_mut(), stop)
                }
                Err(e) => {
                    tracing::warn!(camera_id = self.camera_id, strategy = ?self.strategy, error = %e, "failed to open stream");
                    self.record_failure()
                }
            };

            match end {
                StreamEnd::Stopped => return CaptureExit::Stopped,
                StreamEnd::Exhausted => return self.exhausted(),
                StreamEnd::Reopen => {}
            }

            self.transition(CaptureState::Reconnecting);
            if self.take_fallback() {
                continue;
            }
            if !pause(self.settings.reconnect_interval, stop) {
                return CaptureExit::Stopped;
            }
        }
        CaptureExit::Stopped
    }

    fn read_loop(&mut self, source: &mut dyn FrameSource, stop: &AtomicBool) -> StreamEnd {
        let mut meter = FpsMeter::new();
        loop {
            if stop.load(Ordering::Relaxed) {
                return StreamEnd::Stopped;
            }
            match source.read() {
                ReadOutcome::Frame(frame) => {
                    self.on_frame(&frame, &mut meter);
                }
                ReadOutcome::Empty => {
                    self.failures += 1;
                    self.sink.mark_dead();
                    tracing::debug!(camera_id = self.camera_id, failures = self.failures, "empty read");
                    if self.failures >= self.settings.max_failures {
                        return StreamEnd::Exhausted;
                    }
                    self.transition(CaptureState::Reconnecting);
                    if !pause(self.settings.read_retry, stop) {
                        return StreamEnd::Stopped;
                    }
                }
                ReadOutcome::Closed => {
                    tracing::warn!(camera_id = self.camera_id, "stream closed");
                    return self.record_failure();
                }
                ReadOutcome::Error(e) => {
                    tracing::warn!(camera_id = self.camera_id, error = %e, "read error");
                    return self.record_failure();
                }
            }
        }
    }

    fn on_frame(&mut self, frame: &CapturedFrame, meter: &mut FpsMeter) {
        self.failures = 0;
        if self.state != CaptureState::Streaming {
            self.transition(CaptureState::Streaming);
        }
        self.pipeline_errors = 0;
        self.frames += 1;
        self.last_frame_at = Some(Local::now());

        if let Err(e) = self.sink.publish_frame(frame) {
            tracing::warn!(camera_id = self.camera_id, error = %e, "failed to publish frame");
        }
        if let Some(fps) = meter.tick() {
            self.fps = Some(fps);
            if let Err(e) = self.sink.publish_fps(fps) {
                tracing::warn!(camera_id = self.camera_id, error = %e, "failed to publish fps");
            }
        }
        let every = self.settings.snapshot_every;
        if let Some(dir) = self.settings.snapshot_dir.as_deref() {
            if every > 0 && self.frames % every == 0 {
                if let Err(e) = self.sink.rotate_snapshot(dir, frame) {
                    tracing::warn!(camera_id = self.camera_id, error = %e, "failed to write snapshot");
                }
            }
        }
    }

    fn record_failure(&mut self) -> StreamEnd {
        self.failures += 1;
        if matches!(self.strategy, DecodeStrategy::Pipeline(_)) {
            self.pipeline_errors += 1;
        }
        self.sink.mark_dead();
        if self.failures >= self.settings.max_failures {
            StreamEnd::Exhausted
        } else {
            StreamEnd::Reopen
        }
    }

    /// Switches to the direct reader once the pipeline has failed often enough.
    /// Never switches back within this task.
    fn take_fallback(&mut self) -> bool {
        if matches!(self.strategy, DecodeStrategy::Pipeline(_))
            && self.pipeline_errors >= self.settings.pipeline_error_limit
        {
            tracing::warn!(
                camera_id = self.camera_id,
                errors = self.pipeline_errors,
                "pipeline keeps failing, falling back to direct reader"
            );
            self.strategy = DecodeStrategy::Direct;
            self.fell_back = true;
            return true;
        }
        false
    }

    fn exhausted(&mut self) -> CaptureExit {
        let failures = self.failures;
        tracing::error!(camera_id = self.camera_id, failures, "too many consecutive failures");
        if self.fell_back {
            CaptureExit::FallbackExhausted { failures }
        } else {
            CaptureExit::Exhausted { failures }
        }
    }

    fn transition(&mut self, next: CaptureState) {
        if self.state == next {
            return;
        }
        tracing::debug!(camera_id = self.camera_id, from = ?self.state, to = ?next, "capture state change");
        self.state = next;
        self.report();
    }

    fn report(&self) {
        if let Some(tx) = &self.reports {
            let _ = tx.send(CaptureReport {
                camera_id: self.camera_id,
                generation: self.generation,
                state: self.state,
                failures: self.failures,
                fps: self.fps,
                last_frame_at: self.last_frame_at,
            });
        }
    }
}

/// Sleeps in short slices. Returns false if stopped first.
fn pause(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Frame,
        Empty,
        Closed,
        Error,
    }

    struct FakeSource {
        steps: VecDeque<Step>,
        then: Step,
        tag: Vec<u8>,
    }

    impl FrameSource for FakeSource {
        fn read(&mut self) -> ReadOutcome {
            thread::sleep(Duration::from_millis(1));
            match self.steps.pop_front().unwrap_or(self.then) {
                Step::Frame => ReadOutcome::Frame(CapturedFrame {
                    jpeg: self.tag.clone(),
                    width: 4,
                    height: 4,
                }),
                Step::Empty => ReadOutcome::Empty,
                Step::Closed => ReadOutcome::Closed,
                Step::Error => ReadOutcome::Error(CaptureError::ReadFailed("decoder error".into())),
            }
        }
    }

    /// Scripted per strategy: each open pops the next plan, `None` means the open fails.
    #[derive(Default)]
    struct FakeOpener {
        probe_ok: bool,
        probes: AtomicUsize,
        pipeline: Mutex<VecDeque<Option<(Vec<Step>, Step)>>>,
        direct: Mutex<VecDeque<Option<(Vec<Step>, Step)>>>,
        opened: Mutex<Vec<DecodeStrategy>>,
    }

    impl SourceOpener for FakeOpener {
        fn probe(&self, _url: &str) -> Result<Resolution, CaptureError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_ok {
                Ok(Resolution {
                    width: 4,
                    height: 4,
                })
            } else {
                Err(CaptureError::ProbeFailed("no route".into()))
            }
        }

        fn open(&self, url: &str, strategy: DecodeStrategy) -> Result<Box<dyn FrameSource>, CaptureError> {
            self.opened.lock().unwrap().push(strategy);
            let queue = match strategy {
                DecodeStrategy::Pipeline(_) => &self.pipeline,
                DecodeStrategy::Direct => &self.direct,
            };
            match queue.lock().unwrap().pop_front().flatten() {
                Some((steps, then)) => Ok(Box::new(FakeSource {
                    steps: steps.into(),
                    then,
                    tag: url.as_bytes().to_vec(),
                })),
                None => Err(CaptureError::ConnectFailed("connection refused".into())),
            }
        }
    }

    fn settings(max_failures: u32) -> CaptureSettings {
        let mut s = CaptureSettings::from(&CaptureConfig::default());
        s.max_failures = max_failures;
        s.read_retry = Duration::from_millis(1);
        s.reconnect_interval = Duration::from_millis(1);
        s.probe_retry_delay = Duration::from_millis(1);
        s.snapshot_dir = None;
        s
    }

    fn run_task(
        rt: &tokio::runtime::Runtime,
        store: &MemoryStore,
        opener: Arc<FakeOpener>,
        settings: CaptureSettings,
    ) -> CaptureExit {
        let sink = FrameSink::new(Arc::new(store.clone()), rt.handle().clone(), 7, "rtsp://cam7");
        let stop = AtomicBool::new(false);
        CaptureTask::new(7, 1, "rtsp://cam7", settings, opener, sink).run(&stop)
    }

    fn status(rt: &tokio::runtime::Runtime, store: &MemoryStore) -> Option<String> {
        rt.block_on(store.get_string(&keys::status(7))).unwrap()
    }

    #[test]
    fn test_empty_reads_exhaust_without_reopening() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = MemoryStore::new();
        let opener = Arc::new(FakeOpener {
            probe_ok: true,
            pipeline: Mutex::new(VecDeque::from([Some((vec![], Step::Empty))])),
            ..Default::default()
        });
        let exit = run_task(&rt, &store, opener.clone(), settings(3));
        assert_eq!(exit, CaptureExit::Exhausted { failures: 3 });
        assert_eq!(opener.opened.lock().unwrap().len(), 1);
        assert_eq!(status(&rt, &store).as_deref(), Some("False"));
    }

    #[test]
    fn test_frames_publish_liveness_keys() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = MemoryStore::with_journal();
        let mut s = settings(3);
        s.pipeline_error_limit = 100;
        let opener = Arc::new(FakeOpener {
            probe_ok: true,
            pipeline: Mutex::new(VecDeque::from([Some((vec![Step::Frame; 5], Step::Closed))])),
            ..Default::default()
        });
        let exit = run_task(&rt, &store, opener.clone(), s);
        assert_eq!(exit, CaptureExit::Exhausted { failures: 3 });
        assert_eq!(store.writes_to(&keys::latest_frame(7)).len(), 5);
        assert_eq!(
            rt.block_on(store.get(&keys::latest_frame(7))).unwrap(),
            Some(b"rtsp://cam7".to_vec())
        );
        let ts = rt.block_on(store.get_string(&keys::last_timestamp(7))).unwrap().unwrap();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(
            rt.block_on(store.get_string(&keys::url(7))).unwrap().as_deref(),
            Some("rtsp://cam7")
        );
        // one open for the frames, then two failed reopens
        assert_eq!(opener.opened.lock().unwrap().len(), 3);
        assert_eq!(status(&rt, &store).as_deref(), Some("False"));
    }

    #[test]
    fn test_pipeline_errors_fall_back_to_direct_once() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = MemoryStore::new();
        let mut s = settings(10);
        s.pipeline_error_limit = 2;
        let opener = Arc::new(FakeOpener {
            probe_ok: true,
            pipeline: Mutex::new(VecDeque::from([Some((vec![Step::Frame], Step::Error)), None])),
            direct: Mutex::new(VecDeque::from([Some((vec![Step::Frame; 3], Step::Closed))])),
            ..Default::default()
        });
        let exit = run_task(&rt, &store, opener.clone(), s);
        assert_eq!(exit, CaptureExit::FallbackExhausted { failures: 10 });

        let opened = opener.opened.lock().unwrap().clone();
        assert!(matches!(opened[0], DecodeStrategy::Pipeline(_)));
        assert!(matches!(opened[1], DecodeStrategy::Pipeline(_)));
        assert!(opened[2..].iter().all(|s| *s == DecodeStrategy::Direct));
    }

    #[test]
    fn test_probe_failure_goes_direct() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = MemoryStore::new();
        let opener = Arc::new(FakeOpener::default());
        let exit = run_task(&rt, &store, opener.clone(), settings(2));
        assert_eq!(exit, CaptureExit::Exhausted { failures: 2 });
        assert_eq!(opener.probes.load(Ordering::SeqCst), 3);
        assert!(opener
            .opened
            .lock()
            .unwrap()
            .iter()
            .all(|s| *s == DecodeStrategy::Direct));
    }

    #[test]
    fn test_stop_flag_ends_streaming() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = MemoryStore::new();
        let opener = Arc::new(FakeOpener {
            probe_ok: true,
            pipeline: Mutex::new(VecDeque::from([Some((vec![], Step::Frame))])),
            ..Default::default()
        });
        let stop = Arc::new(AtomicBool::new(false));
        let sink = FrameSink::new(Arc::new(store.clone()), rt.handle().clone(), 7, "rtsp://cam7");
        let task = CaptureTask::new(7, 1, "rtsp://cam7", settings(3), opener, sink);
        let flag = stop.clone();
        let worker = thread::spawn(move || task.run(&flag));
        thread::sleep(Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        assert_eq!(worker.join().unwrap(), CaptureExit::Stopped);
        assert_eq!(status(&rt, &store).as_deref(), Some("True"));
    }

    #[test]
    fn test_snapshots_keep_only_latest_file() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = MemoryStore::new();
        let dir = std::env::temp_dir().join(format!("visionflow-snap-{}", std::process::id()));
        let mut s = settings(1);
        s.snapshot_every = 2;
        s.snapshot_dir = Some(dir.clone());
        let opener = Arc::new(FakeOpener {
            probe_ok: true,
            pipeline: Mutex::new(VecDeque::from([Some((vec![Step::Frame; 6], Step::Closed))])),
            ..Default::default()
        });
        run_task(&rt, &store, opener, s);

        fn count_files(path: &Path) -> usize {
            std::fs::read_dir(path)
                .map(|entries| {
                    entries
                        .flatten()
                        .map(|e| {
                            let p = e.path();
                            if p.is_dir() {
                                count_files(&p)
                            } else {
                                1
                            }
                        })
                        .sum()
                })
                .unwrap_or(0)
        }
        assert_eq!(count_files(&dir.join("7")), 1);
        let latest = rt
            .block_on(store.get_string(&keys::latest_frame_path(7)))
            .unwrap()
            .unwrap();
        assert!(Path::new(&latest).exists());
        assert!(latest.starts_with(&*dir.join("7").to_string_lossy()));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_fps_meter_waits_for_full_window() {
        let mut meter = FpsMeter::new();
        assert_eq!(meter.tick(), None);
        meter.window_start = Instant::now() - Duration::from_secs(2);
        let fps = meter.tick().unwrap();
        assert!((fps - 1.0).abs() < 0.1);
        assert_eq!(meter.frames, 0);
    }
}
