use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::source::SourceOpener;
use super::task::{CaptureExit, CaptureReport, CaptureTask, FrameSink};
use super::CaptureSettings;
use crate::store::{keys, FrameStore, StoreError};

struct RunningCapture {
    url: String,
    generation: u64,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<CaptureExit>,
}

/// Parses `"{id}|{url}"` tokens. Malformed tokens are skipped; on duplicate ids
/// the lexicographically last token wins.
pub fn parse_assignment(tokens: &BTreeSet<String>) -> BTreeMap<u64, String> {
    let mut assignment = BTreeMap::new();
    for token in tokens {
        let parsed = token
            .split_once('|')
            .and_then(|(id, url)| Some((id.trim().parse::<u64>().ok()?, url)))
            .filter(|(_, url)| !url.is_empty());
        match parsed {
            Some((id, url)) => {
                assignment.insert(id, url.to_string());
            }
            None => tracing::warn!(%token, "ignoring malformed assignment token"),
        }
    }
    assignment
}

/// Owns this worker's capture tasks. A camera is stopped and joined before its
/// replacement starts, so two tasks never write the same camera's keys.
pub struct CaptureSupervisor {
    worker_id: u32,
    store: Arc<dyn FrameStore>,
    opener: Arc<dyn SourceOpener>,
    settings: CaptureSettings,
    max_concurrent: usize,
    liveness_interval: Duration,
    running: BTreeMap<u64, RunningCapture>,
    desired: BTreeMap<u64, String>,
    next_generation: u64,
    reports_tx: mpsc::UnboundedSender<CaptureReport>,
    reports_rx: mpsc::UnboundedReceiver<CaptureReport>,
    latest: HashMap<u64, CaptureReport>,
}

impl CaptureSupervisor {
    pub fn new(
        worker_id: u32,
        store: Arc<dyn FrameStore>,
        opener: Arc<dyn SourceOpener>,
        settings: CaptureSettings,
        max_concurrent: usize,
        liveness_interval: Duration,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            worker_id,
            store,
            opener,
            settings,
            max_concurrent: max_concurrent.max(1),
            liveness_interval,
            running: BTreeMap::new(),
            desired: BTreeMap::new(),
            next_generation: 0,
            reports_tx,
            reports_rx,
            latest: HashMap::new(),
        }
    }

    pub fn running_ids(&self) -> Vec<u64> {
        self.running.keys().copied().collect()
    }

    pub fn is_running(&self, camera_id: u64) -> bool {
        self.running
            .get(&camera_id)
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Most recent state report per camera from its current task.
    pub fn reports(&mut self) -> &HashMap<u64, CaptureReport> {
        while let Ok(report) = self.reports_rx.try_recv() {
            let current = self
                .running
                .get(&report.camera_id)
                .is_some_and(|r| r.generation == report.generation);
            if current {
                self.latest.insert(report.camera_id, report);
            }
        }
        &self.latest
    }

    /// Re-reads this worker's token set and applies it.
    pub async fn refresh(&mut self) -> Result<(), StoreError> {
        let tokens = self
            .store
            .set_members(&keys::worker_urls(self.worker_id))
            .await?;
        self.apply(parse_assignment(&tokens)).await;
        Ok(())
    }

    pub async fn apply(&mut self, desired: BTreeMap<u64, String>) {
        let stale: Vec<u64> = self
            .running
            .iter()
            .filter(|(id, r)| desired.get(id) != Some(&r.url))
            .map(|(id, _)| *id)
            .collect();
        self.stop_all(&stale).await;
        for id in stale.iter().filter(|id| !desired.contains_key(id)) {
            self.clear_camera_keys(*id).await;
        }

        if desired.len() > self.max_concurrent {
            tracing::warn!(
                worker_id = self.worker_id,
                assigned = desired.len(),
                limit = self.max_concurrent,
                "more cameras assigned than this worker will run"
            );
        }
        self.desired = desired;
        for (id, url) in self.desired.clone() {
            if self.running.contains_key(&id) {
                continue;
            }
            if self.running.len() >= self.max_concurrent {
                tracing::warn!(worker_id = self.worker_id, camera_id = id, "concurrency limit reached, not starting");
                continue;
            }
            self.start(id, &url);
        }
    }

    /// Relaunches tasks that exited while their camera is still assigned.
    pub async fn sweep(&mut self) {
        let finished: Vec<u64> = self
            .running
            .iter()
            .filter(|(_, r)| r.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            let Some(capture) = self.running.remove(&id) else {
                continue;
            };
            match capture.handle.await {
                Ok(exit) => tracing::warn!(camera_id = id, ?exit, "capture task exited"),
                Err(e) => tracing::error!(camera_id = id, error = %e, "capture task panicked"),
            }
            self.latest.remove(&id);
            if let Some(url) = self.desired.get(&id).cloned() {
                tracing::info!(camera_id = id, "relaunching capture task");
                self.start(id, &url);
            }
        }
    }

    pub async fn shutdown(&mut self) {
        let ids: Vec<u64> = self.running.keys().copied().collect();
        self.stop_all(&ids).await;
        self.desired.clear();
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        let channel = keys::worker_update_channel(self.worker_id);
        let mut updates = self.store.subscribe(&channel).await?;
        tracing::info!(worker_id = self.worker_id, %channel, "capture supervisor started");

        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "initial assignment read failed");
        }

        let mut liveness = tokio::time::interval(self.liveness_interval);
        let result = loop {
            tokio::select! {
                message = updates.recv() => match message {
                    Some(_) => {
                        if let Err(e) = self.refresh().await {
                            tracing::warn!(error = %e, "assignment refresh failed");
                        } else {
                            tracing::info!(cameras = ?self.running_ids(), "assignment applied");
                        }
                    }
                    None => {
                        tracing::error!(%channel, "update subscription closed");
                        break Err(StoreError::Closed);
                    }
                },
                _ = liveness.tick() => {
                    self.sweep().await;
                    for (id, report) in self.reports() {
                        tracing::trace!(camera_id = id, state = ?report.state, failures = report.failures, "capture status");
                    }
                }
                _ = shutdown.changed() => break Ok(()),
            }
        };

        self.shutdown().await;
        tracing::info!(worker_id = self.worker_id, "capture supervisor stopped");
        result
    }

    fn start(&mut self, camera_id: u64, url: &str) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let stop = Arc::new(AtomicBool::new(false));
        let sink = FrameSink::new(self.store.clone(), Handle::current(), camera_id, url);
        let task = CaptureTask::new(
            camera_id,
            generation,
            url,
            self.settings.clone(),
            self.opener.clone(),
            sink,
        )
        .with_reports(self.reports_tx.clone());

        let flag = stop.clone();
        let handle = tokio::task::spawn_blocking(move || task.run(&flag));
        tracing::info!(camera_id, generation, %url, "capture task spawned");
        self.running.insert(
            camera_id,
            RunningCapture {
                url: url.to_string(),
                generation,
                stop,
                handle,
            },
        );
    }

    /// Signals every listed task first, then waits for each to finish.
    async fn stop_all(&mut self, ids: &[u64]) {
        let mut stopping = Vec::new();
        for id in ids {
            if let Some(capture) = self.running.remove(id) {
                capture.stop.store(true, Ordering::Relaxed);
                stopping.push((*id, capture));
            }
        }
        for (id, capture) in stopping {
            match capture.handle.await {
                Ok(exit) => tracing::info!(camera_id = id, generation = capture.generation, ?exit, "capture task stopped"),
                Err(e) => tracing::error!(camera_id = id, error = %e, "capture task panicked"),
            }
            self.latest.remove(&id);
        }
    }

    /// Deletes the keys a stopped task wrote for a camera this worker no longer owns.
    async fn clear_camera_keys(&self, camera_id: u64) {
        let owned = [
            keys::latest_frame(camera_id),
            keys::status(camera_id),
            keys::last_timestamp(camera_id),
            keys::fps(camera_id),
            keys::url(camera_id),
            keys::latest_frame_path(camera_id),
        ];
        for key in &owned {
            if let Err(e) = self.store.delete(key).await {
                tracing::warn!(camera_id, %key, error = %e, "failed to clear camera key");
            }
        }
    }
}
