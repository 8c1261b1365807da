use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{FrameStore, StoreError, Subscription};

#[derive(Default)]
struct Inner {
    values: HashMap<String, Vec<u8>>,
    sets: HashMap<String, BTreeSet<String>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    journal: Option<Vec<(String, Vec<u8>)>>,
}

/// In-process store with the same semantics as the shared one. Cloning shares state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that also records every `set` in order, for inspecting write sequences.
    pub fn with_journal() -> Self {
        let store = Self::default();
        store.write().journal = Some(Vec::new());
        store
    }

    /// Values written to `key`, oldest first. Empty unless created with [`with_journal`].
    ///
    /// [`with_journal`]: MemoryStore::with_journal
    pub fn writes_to(&self, key: &str) -> Vec<Vec<u8>> {
        self.read()
            .journal
            .as_ref()
            .map(|journal| {
                journal
                    .iter()
                    .filter(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FrameStore for MemoryStore {
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.write();
        if let Some(journal) = inner.journal.as_mut() {
            journal.push((key.to_string(), value.to_vec()));
        }
        inner.values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read().values.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.write();
        inner.values.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.write()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.write();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                inner.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.read().sets.get(key).cloned().unwrap_or_default())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut inner = self.write();
        if let Some(subscribers) = inner.subscribers.get_mut(channel) {
            subscribers.retain(|tx| tx.send(message.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.read();
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .chain(inner.sets.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
