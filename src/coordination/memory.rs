//! In-process implementations of the store and bus contracts.
//!
//! Used by the test suites and by `--in-memory` runs of the daemon.  The
//! store can be switched offline to simulate a backend outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::pubsub::{BusError, MessageBus};
use super::store::{SharedStore, StoreError};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    offline: AtomicBool,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a connectivity outage: every call fails with
    /// [`StoreError::Unavailable`] until [`MemoryStore::set_online`].
    pub fn set_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn set_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    /// Total number of calls received, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A poisoned map is still structurally valid.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut entries = self.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.lock().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Fan-out bus: every subscriber of a topic receives every publish.
#[derive(Debug, Default)]
pub struct LocalBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    published: Mutex<Vec<(String, String)>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(topic, payload)` published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p)
            .collect()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_string(), payload.to_string()));

        let senders: Vec<mpsc::Sender<String>> = {
            let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            let list = subs.entry(topic.to_string()).or_default();
            list.retain(|tx| !tx.is_closed());
            list.clone()
        };
        for tx in senders {
            // A subscriber that went away between retain and send is fine.
            let _ = tx.send(payload.to_string()).await;
        }
        trace!(%topic, "local publish");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, BusError> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
