//! Shared key-value frame store.
//!
//! Every process talks to the store through [`FrameStore`]. Capture workers write frames and
//! liveness keys, the assignment publisher maintains the per-worker token sets, and the event
//! engine reads frames back and writes annotated images.

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod keys;
mod memory;
mod redis_store;
pub mod status;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use status::{camera_statuses, CameraHealth, CameraStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store connection closed")]
    Closed,
}

#[async_trait]
pub trait FrameStore: Send + Sync {
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// Every key starting with `prefix`, sorted.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get(key)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// Messages published on one channel, in publish order.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub(crate) fn new(channel: &str, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.to_string(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message. `None` once the store side has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}
