//! Connection failover for every call into the shared store.
//!
//! When an operation fails with a connectivity error, callers race an
//! election keyed by the failure generation they observed before the call.
//! Exactly one caller per outage wins, bumps the generation, raises the
//! `recovering` flag, and probes the store until a write succeeds.  Every
//! other caller (and every new caller) polls the flag and retries its own
//! operation once the flag clears.
//!
//! The election is process-local.  Several processes sharing one store will
//! each run their own probe loop for the same outage.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::store::{SharedStore, StoreError};
use crate::config::FailoverConfig;
use crate::metrics::MetricsRegistry;

pub struct FailoverGuard {
    store: Arc<dyn SharedStore>,
    generation: Mutex<u64>,
    recovering: AtomicBool,
    recoveries: AtomicU64,
    probe_interval: Duration,
    poll_interval: Duration,
    probe_key: String,
    metrics: MetricsRegistry,
}

/// Clears the recovering flag when the recoverer finishes or is dropped
/// mid-probe.  In the latter case the next caller to fail is elected.
struct RecoveringFlag<'a>(&'a AtomicBool);

impl Drop for RecoveringFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl FailoverGuard {
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: &FailoverConfig,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            generation: Mutex::new(0),
            recovering: AtomicBool::new(false),
            recoveries: AtomicU64::new(0),
            probe_interval: config.probe_interval(),
            poll_interval: config.poll_interval(),
            probe_key: config.probe_key.clone(),
            metrics,
        }
    }

    /// Current failure generation: the number of outages seen so far.
    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Number of probe loops that ended in a successful probe.
    pub fn completed_recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::SeqCst)
    }

    /// Run `op` against the store.
    ///
    /// Connectivity errors never escape: the caller waits out the outage and
    /// `op` is re-run.  Any other error is returned as-is.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(Arc<dyn SharedStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        loop {
            let Some(observed) = self.connected_generation() else {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            };
            match op(Arc::clone(&self.store)).await {
                Err(StoreError::Unavailable(reason)) => {
                    debug!(generation = observed, %reason, "store call hit connectivity error");
                    self.recover(observed, &reason).await;
                }
                other => return other,
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.execute(|store| async move { store.get(key).await })
            .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.execute(|store| async move { store.set(key, value).await })
            .await
    }

    pub async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.execute(|store| async move { store.set_if_absent(key, value).await })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.execute(|store| async move { store.delete(key).await })
            .await
    }

    /// The generation a call is about to run under, or `None` while a
    /// recovery is in progress.  Read under the same lock the election takes,
    /// so a caller can never observe a generation whose outage is already
    /// being recovered.
    fn connected_generation(&self) -> Option<u64> {
        let generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        if self.recovering.load(Ordering::SeqCst) {
            None
        } else {
            Some(*generation)
        }
    }

    async fn recover(&self, observed: u64, reason: &str) {
        let elected = {
            let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
            if *generation == observed {
                *generation += 1;
                self.recovering.store(true, Ordering::SeqCst);
                Some(*generation)
            } else {
                None
            }
        };
        let Some(generation) = elected else {
            // Someone else already owns this outage.
            return;
        };

        let _flag = RecoveringFlag(&self.recovering);
        self.metrics.metrics.store_outages.inc();
        warn!(generation, %reason, "shared store unreachable, quarantining callers");

        let mut probes: u64 = 0;
        loop {
            tokio::time::sleep(self.probe_interval).await;
            probes += 1;
            self.metrics.metrics.recovery_probes.inc();
            let stamp = chrono::Utc::now().timestamp_millis().to_string();
            match self.store.set(&self.probe_key, &stamp).await {
                Ok(()) => break,
                Err(e) => debug!(generation, probes, error = %e, "recovery probe failed"),
            }
        }

        self.recoveries.fetch_add(1, Ordering::SeqCst);
        info!(generation, probes, "shared store recovered, releasing callers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryStore;

    fn fast_config() -> FailoverConfig {
        FailoverConfig {
            probe_interval_ms: 20,
            poll_interval_ms: 5,
            probe_key: "probe".into(),
        }
    }

    fn guard_over(store: Arc<MemoryStore>) -> FailoverGuard {
        FailoverGuard::new(store, &fast_config(), MetricsRegistry::new())
    }

    #[tokio::test]
    async fn passes_through_when_connected() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard_over(Arc::clone(&store));
        assert!(guard.set_if_absent("k", "v").await.unwrap());
        assert_eq!(guard.get("k").await.unwrap().as_deref(), Some("v"));
        guard.delete("k").await.unwrap();
        assert_eq!(guard.generation(), 0);
        assert!(!guard.is_recovering());
    }

    #[tokio::test]
    async fn backend_errors_are_returned() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard_over(store);
        let err = guard
            .execute(|_| async { Err::<(), _>(StoreError::Backend("WRONGTYPE".into())) })
            .await
            .unwrap_err();
        assert!(!err.is_unavailable());
        assert_eq!(guard.generation(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_recovery_per_outage() {
        let store = Arc::new(MemoryStore::new());
        let guard = Arc::new(guard_over(Arc::clone(&store)));
        let restored = Arc::new(AtomicBool::new(false));

        store.set_offline();

        let mut callers = Vec::new();
        for i in 0..16 {
            let guard = Arc::clone(&guard);
            let restored = Arc::clone(&restored);
            callers.push(tokio::spawn(async move {
                let key = format!("k{i}");
                guard.set(&key, "v").await.unwrap();
                // Nobody may get through before the store came back.
                assert!(restored.load(Ordering::SeqCst));
            }));
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(guard.is_recovering());
        restored.store(true, Ordering::SeqCst);
        store.set_online();

        for caller in callers {
            caller.await.unwrap();
        }

        assert_eq!(guard.generation(), 1);
        assert_eq!(guard.completed_recoveries(), 1);
        assert!(!guard.is_recovering());
        assert!(store.contains("probe"));
        assert!(store.contains("k15"));
    }

    #[tokio::test(start_paused = true)]
    async fn quarantined_callers_stay_off_the_store() {
        let store = Arc::new(MemoryStore::new());
        let metrics = MetricsRegistry::new();
        let guard = Arc::new(FailoverGuard::new(
            Arc::clone(&store) as Arc<dyn SharedStore>,
            &FailoverConfig::default(),
            metrics.clone(),
        ));
        store.set_offline();

        let callers: Vec<_> = (0..16)
            .map(|i| {
                let guard = Arc::clone(&guard);
                tokio::spawn(async move { guard.set(&format!("k{i}"), "v").await })
            })
            .collect();

        // One failed call elects the recoverer; after that only its probes,
        // one per second, reach the store.
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(store.call_count(), 1 + 5);
        assert_eq!(metrics.metrics.recovery_probes.get(), 5);

        store.set_online();
        for caller in callers {
            caller.await.unwrap().unwrap();
        }
        // The successful probe, then each caller's operation once.
        assert_eq!(store.call_count(), 6 + 1 + 16);
        assert_eq!(metrics.metrics.store_outages.get(), 1);
        assert_eq!(guard.completed_recoveries(), 1);
    }

    #[tokio::test]
    async fn separate_outages_get_separate_generations() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard_over(Arc::clone(&store));

        for expected in 1..=2 {
            store.set_offline();
            let bring_back = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    store.set_online();
                })
            };
            guard.set("k", "v").await.unwrap();
            bring_back.await.unwrap();
            assert_eq!(guard.generation(), expected);
        }
        assert_eq!(guard.completed_recoveries(), 2);
    }

    #[tokio::test]
    async fn dropped_recoverer_clears_flag() {
        let store = Arc::new(MemoryStore::new());
        let guard = guard_over(Arc::clone(&store));
        store.set_offline();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(60), guard.set("k", "v")).await;
        assert!(timed_out.is_err());
        assert!(!guard.is_recovering());

        store.set_online();
        guard.set("k", "v").await.unwrap();
        assert_eq!(guard.generation(), 1);
    }
}
