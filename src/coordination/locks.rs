//! Named leases over the shared store.
//!
//! A lease is held while its key exists.  Acquisition is a conditional
//! write retried at a fixed interval; once the retry budget is spent the
//! holder is presumed stuck, a timeout notification is broadcast for the
//! key, and the key is overwritten.  Liveness wins over exclusivity here:
//! the previous holder is never told, so anything guarded by a lease must
//! tolerate running twice.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::cancellation::CancellationRegistry;
use super::dedup::MessageDeduplicator;
use super::failover::FailoverGuard;
use super::keys::{encode_notification, LeaseKey};
use super::pubsub::MessageBus;
use super::store::StoreError;
use crate::config::LeaseConfig;
use crate::metrics::MetricsRegistry;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease store error: {0}")]
    Store(#[from] StoreError),

    /// Another contender force-acquired the key while this one was retrying.
    #[error("operation timed out")]
    Aborted { key: LeaseKey },
}

impl LeaseError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, LeaseError::Aborted { .. })
    }
}

/// How a lease ended up held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The conditional write succeeded on the given attempt (1-based).
    Granted { attempts: u32 },
    /// Retries were exhausted and the key was overwritten.
    Forced,
}

pub struct LeaseCoordinator {
    guard: Arc<FailoverGuard>,
    bus: Arc<dyn MessageBus>,
    dedup: Arc<MessageDeduplicator>,
    registry: Arc<CancellationRegistry>,
    key_prefix: String,
    timeout_topic: String,
    retry_interval: Duration,
    max_attempts: u32,
    node_id: String,
    metrics: MetricsRegistry,
}

impl LeaseCoordinator {
    pub fn new(
        guard: Arc<FailoverGuard>,
        bus: Arc<dyn MessageBus>,
        dedup: Arc<MessageDeduplicator>,
        registry: Arc<CancellationRegistry>,
        config: &LeaseConfig,
        node_id: String,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            guard,
            bus,
            dedup,
            registry,
            key_prefix: config.key_prefix.clone(),
            timeout_topic: config.timeout_topic.clone(),
            retry_interval: config.retry_interval(),
            max_attempts: config.max_attempts.max(1),
            node_id,
            metrics,
        }
    }

    pub fn store_key(&self, key: &LeaseKey) -> String {
        key.store_key(&self.key_prefix)
    }

    fn holder_value(&self) -> String {
        format!("{}:{}", self.node_id, chrono::Utc::now().timestamp())
    }

    /// One conditional attempt.  Returns `true` if this call created the key.
    pub async fn try_acquire(&self, key: &LeaseKey) -> Result<bool, LeaseError> {
        let store_key = self.store_key(key);
        let acquired = self
            .guard
            .set_if_absent(&store_key, &self.holder_value())
            .await?;
        debug!(%store_key, node_id = %self.node_id, acquired, "try_acquire");
        Ok(acquired)
    }

    /// Acquire `key`, waiting out contention.  Returns `true` once the lease
    /// is granted or force-acquired.
    pub async fn acquire(&self, key: &LeaseKey) -> Result<bool, LeaseError> {
        self.acquire_with_outcome(key).await.map(|_| true)
    }

    /// Retry until granted; once the retry budget is spent, force-acquire.
    ///
    /// While retrying, the caller is registered as a waiter on `key`.  If
    /// another contender force-acquires the key first, the wait ends with
    /// [`LeaseError::Aborted`] instead of a second force.
    pub async fn acquire_with_outcome(&self, key: &LeaseKey) -> Result<LeaseOutcome, LeaseError> {
        let (watch, mut aborted) = self.registry.watch(vec![key.clone()]);

        for attempt in 1..=self.max_attempts {
            if self.try_acquire(key).await? {
                self.metrics.metrics.lease_acquisitions.inc();
                if attempt > 1 {
                    info!(%key, attempts = attempt, "lease acquired after contention");
                }
                return Ok(LeaseOutcome::Granted { attempts: attempt });
            }
            self.metrics.metrics.lease_retries.inc();
            debug!(%key, attempt, max_attempts = self.max_attempts, "lease held elsewhere, retrying");

            tokio::select! {
                biased;
                _ = &mut aborted => {
                    info!(%key, attempt, "lease force-acquired elsewhere, giving up");
                    return Err(LeaseError::Aborted { key: key.clone() });
                }
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }

        // Our own notify must not find this wait.
        drop(watch);
        self.force_acquire(key).await?;
        Ok(LeaseOutcome::Forced)
    }

    async fn force_acquire(&self, key: &LeaseKey) -> Result<(), LeaseError> {
        let store_key = self.store_key(key);
        self.metrics.metrics.lease_timeouts.inc();
        warn!(
            %key,
            %store_key,
            attempts = self.max_attempts,
            "lease stuck, broadcasting timeout and force-acquiring"
        );

        // Waiters in this process are aborted directly: our own delivery of
        // the broadcast is suppressed by the deduplicator.
        self.registry.notify(key);

        // Best effort: waiters elsewhere stay blocked if this is lost, but
        // the acquisition itself goes ahead.
        if let Err(e) = self.publish_timeout(key).await {
            warn!(%key, error = %e, "failed to publish lease timeout notification");
        }

        self.guard.set(&store_key, &self.holder_value()).await?;
        Ok(())
    }

    async fn publish_timeout(&self, key: &LeaseKey) -> anyhow::Result<()> {
        let payload = encode_notification(key)?;
        self.dedup
            .publish(self.bus.as_ref(), &self.timeout_topic, &payload)
            .await?;
        debug!(%key, topic = %self.timeout_topic, "published lease timeout");
        Ok(())
    }

    /// Delete the lease key.  Releasing a free lease is not an error.
    pub async fn release(&self, key: &LeaseKey) -> Result<(), LeaseError> {
        let store_key = self.store_key(key);
        self.guard.delete(&store_key).await?;
        self.metrics.metrics.lease_releases.inc();
        debug!(%store_key, node_id = %self.node_id, "lease released");
        Ok(())
    }

    /// The `<node_id>:<unix_ts>` value of the current holder, if any.
    pub async fn holder(&self, key: &LeaseKey) -> Result<Option<String>, LeaseError> {
        Ok(self.guard.get(&self.store_key(key)).await?)
    }
}
