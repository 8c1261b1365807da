//! Assignment publisher: splits the registry's cameras across capture workers.
//!
//! Each worker owns the store set `worker_{n}_urls` holding `"{id}|{url}"`
//! tokens. After any change, every worker is told to re-read its set through
//! `worker_{n}_urls_update`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::registry::{CameraRecord, CameraRegistry};
use crate::store::{keys, FrameStore, StoreError};

pub const UPDATE_MESSAGE: &str = "updated";

/// Owning worker, 1-indexed.
pub fn worker_for(camera_id: u64, worker_count: u32) -> u32 {
    (camera_id % u64::from(worker_count.max(1))) as u32 + 1
}

pub fn assignment_token(camera_id: u64, url: &str) -> String {
    format!("{camera_id}|{url}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub changed: bool,
    pub camera_ids: BTreeSet<u64>,
}

pub struct AssignmentPublisher {
    store: Arc<dyn FrameStore>,
    registry: Arc<dyn CameraRegistry>,
    worker_count: u32,
    poll_interval: Duration,
    registry_timeout: Duration,
    known_ids: BTreeSet<u64>,
}

impl AssignmentPublisher {
    pub fn new(
        store: Arc<dyn FrameStore>,
        registry: Arc<dyn CameraRegistry>,
        worker_count: u32,
        poll_interval: Duration,
        registry_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            worker_count: worker_count.max(1),
            poll_interval,
            registry_timeout,
            known_ids: BTreeSet::new(),
        }
    }

    /// Brings the worker sets in line with `cameras`.
    ///
    /// When the id set differs from `previous_ids`, every worker set is cleared
    /// and keys of removed cameras are purged before the sets are rebuilt.
    pub async fn reconcile(
        &self,
        cameras: &[CameraRecord],
        previous_ids: &BTreeSet<u64>,
    ) -> Result<Reconciliation, StoreError> {
        let desired: BTreeMap<u64, &str> = cameras
            .iter()
            .map(|c| (c.id, c.stream_url.as_str()))
            .collect();
        let camera_ids: BTreeSet<u64> = desired.keys().copied().collect();
        let mut changed = false;

        if camera_ids != *previous_ids {
            changed = true;
            for worker in 1..=self.worker_count {
                self.store.delete(&keys::worker_urls(worker)).await?;
            }
            let purged = self.purge_removed(&camera_ids).await?;
            tracing::info!(
                cameras = camera_ids.len(),
                purged,
                "camera set changed, rebuilding assignments"
            );
        }

        for (&id, &url) in &desired {
            let set_key = keys::worker_urls(worker_for(id, self.worker_count));
            let token = assignment_token(id, url);
            let prefix = format!("{id}|");
            let members = self.store.set_members(&set_key).await?;
            let existing: Vec<&String> = members.iter().filter(|m| m.starts_with(&prefix)).collect();
            if existing.len() == 1 && *existing[0] == token {
                continue;
            }
            for stale in existing {
                self.store.set_remove(&set_key, stale).await?;
            }
            self.store.set_add(&set_key, &token).await?;
            tracing::debug!(camera_id = id, worker = worker_for(id, self.worker_count), "assignment updated");
            changed = true;
        }

        if changed {
            for worker in 1..=self.worker_count {
                self.store
                    .publish(&keys::worker_update_channel(worker), UPDATE_MESSAGE)
                    .await?;
            }
        }

        Ok(Reconciliation {
            changed,
            camera_ids,
        })
    }

    /// Deletes every `camera_{id}_*` key whose id is no longer present.
    async fn purge_removed(&self, current: &BTreeSet<u64>) -> Result<usize, StoreError> {
        let mut purged = 0;
        for key in self.store.scan_prefix(keys::CAMERA_PREFIX).await? {
            match keys::camera_id_of(&key) {
                Some(id) if !current.contains(&id) => {
                    self.store.delete(&key).await?;
                    purged += 1;
                }
                _ => {}
            }
        }
        Ok(purged)
    }

    /// One registry poll. Registry failures leave the assignment untouched.
    pub async fn poll_once(&mut self) -> Option<Reconciliation> {
        let cameras = match tokio::time::timeout(self.registry_timeout, self.registry.cameras()).await {
            Ok(Ok(cameras)) => cameras,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "registry unavailable, keeping current assignment");
                return None;
            }
            Err(_) => {
                tracing::warn!("registry request timed out, keeping current assignment");
                return None;
            }
        };

        match self.reconcile(&cameras, &self.known_ids).await {
            Ok(outcome) => {
                self.known_ids = outcome.camera_ids.clone();
                if outcome.changed {
                    tracing::info!(cameras = ?outcome.camera_ids, "published new assignment");
                }
                Some(outcome)
            }
            Err(e) => {
                // forget the known set so the next poll rebuilds from scratch
                self.known_ids.clear();
                tracing::error!(error = %e, "failed to write assignment");
                None
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            workers = self.worker_count,
            interval = ?self.poll_interval,
            "assignment publisher started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("assignment publisher stopped");
    }
}
