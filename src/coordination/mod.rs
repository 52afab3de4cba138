//! Distributed coordination layer backed by KeyDB (Redis-compatible).
//!
//! Provides named leases over a shared store, failover for store outages,
//! deduplicated pub/sub delivery, and cancellation of work whose lease was
//! broken elsewhere.  All shared state lives in the store so that many
//! processes can cooperate without sharing memory.

pub mod cancellation;
pub mod dedup;
pub mod failover;
pub mod keys;
pub mod locks;
pub mod memory;
pub mod node;
pub mod pubsub;
pub mod redis;
pub mod store;

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::metrics::MetricsRegistry;

use cancellation::{CancelError, CancellationRegistry};
use dedup::MessageDeduplicator;
use failover::FailoverGuard;
use keys::LeaseKey;
use locks::{LeaseCoordinator, LeaseError};
use pubsub::{BusError, MessageBus};
use store::SharedStore;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Cancelled(#[from] CancelError),
}

impl CoordinationError {
    /// The lease was force-acquired elsewhere, either while waiting for it
    /// or while running under it.
    pub fn is_aborted(&self) -> bool {
        match self {
            CoordinationError::Lease(e) => e.is_aborted(),
            CoordinationError::Cancelled(e) => e.is_aborted(),
        }
    }
}

/// One process's view of the coordination layer: every component wired to a
/// shared store and bus.
pub struct Coordinator {
    pub guard: Arc<FailoverGuard>,
    pub leases: Arc<LeaseCoordinator>,
    pub registry: Arc<CancellationRegistry>,
    pub dedup: Arc<MessageDeduplicator>,
    bus: Arc<dyn MessageBus>,
    timeout_topic: String,
    node_id: String,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        bus: Arc<dyn MessageBus>,
        config: &Config,
        node_id: String,
        metrics: MetricsRegistry,
    ) -> Self {
        let guard = Arc::new(FailoverGuard::new(store, &config.failover, metrics.clone()));
        let dedup = Arc::new(MessageDeduplicator::new(
            Arc::clone(&guard),
            &config.dedup,
            node_id.clone(),
            metrics.clone(),
        ));
        let registry = Arc::new(CancellationRegistry::new(metrics.clone()));
        let leases = Arc::new(LeaseCoordinator::new(
            Arc::clone(&guard),
            Arc::clone(&bus),
            Arc::clone(&dedup),
            Arc::clone(&registry),
            &config.lease,
            node_id.clone(),
            metrics,
        ));
        Self {
            guard,
            leases,
            registry,
            dedup,
            bus,
            timeout_topic: config.lease.timeout_topic.clone(),
            node_id,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Start delivering timeout notifications to this process's registry.
    pub async fn start(&self) -> Result<JoinHandle<()>, BusError> {
        Arc::clone(&self.registry)
            .listen(
                Arc::clone(&self.bus),
                Arc::clone(&self.dedup),
                self.timeout_topic.clone(),
            )
            .await
    }

    /// Acquire `key`, run `work` interruptably, then release.
    ///
    /// A timeout notification for `key` ends the call with an aborted error
    /// at either stage: while still waiting for the lease, or while the work
    /// runs.  The work is registered only after the lease is held, so this
    /// process's own force-acquire never aborts it.  Aborted work leaves the
    /// key to whoever forced it rather than releasing it.
    pub async fn run_exclusive<T, Fut>(&self, key: LeaseKey, work: Fut) -> Result<T, CoordinationError>
    where
        T: Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.leases.acquire(&key).await?;
        let result = self
            .registry
            .run_interruptable(vec![key.clone()], work)
            .await;

        match result {
            Err(e) if e.is_aborted() => {
                debug!(%key, "lease broken while running, not releasing");
                Err(e.into())
            }
            other => {
                self.leases.release(&key).await?;
                Ok(other?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{FailoverConfig, LeaseConfig};
    use memory::{LocalBus, MemoryStore};

    fn config() -> Config {
        Config {
            lease: LeaseConfig {
                retry_interval_ms: 10,
                max_attempts: 3,
                ..LeaseConfig::default()
            },
            failover: FailoverConfig {
                probe_interval_ms: 10,
                poll_interval_ms: 5,
                ..FailoverConfig::default()
            },
            ..Config::default()
        }
    }

    fn coordinator(store: &Arc<MemoryStore>, bus: &Arc<LocalBus>, node: &str) -> Coordinator {
        Coordinator::new(
            store.clone(),
            bus.clone(),
            &config(),
            node.to_string(),
            MetricsRegistry::new(),
        )
    }

    #[tokio::test]
    async fn run_exclusive_releases_after_success() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalBus::new());
        let node = coordinator(&store, &bus, "node-a");
        let key = LeaseKey::new("Orders", "42");

        let value = node.run_exclusive(key.clone(), async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
        assert!(!store.contains("lease-Orders-42"));
    }

    #[tokio::test]
    async fn run_exclusive_releases_after_failure() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalBus::new());
        let node = coordinator(&store, &bus, "node-a");

        let err = node
            .run_exclusive(LeaseKey::new("Orders", "42"), async {
                Err::<(), _>(anyhow::anyhow!("boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Cancelled(CancelError::Failed(_))));
        assert!(!store.contains("lease-Orders-42"));
    }

    #[tokio::test]
    async fn own_broadcast_does_not_abort_own_work() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalBus::new());
        let stuck = coordinator(&store, &bus, "node-a");
        let node = coordinator(&store, &bus, "node-b");
        let _listener = node.start().await.unwrap();
        let key = LeaseKey::new("Orders", "42");

        stuck.leases.acquire(&key).await.unwrap();
        let value = node
            .run_exclusive(key.clone(), async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("finished")
            })
            .await
            .unwrap();
        assert_eq!(value, "finished");
        assert_eq!(bus.published().len(), 1);
    }
}
