//! Cross-process cancellation of work blocked on a broken lease.
//!
//! [`CancellationRegistry::run_interruptable`] runs a unit of work on a
//! background task and registers the caller under the lease keys the work
//! depends on.  The caller receives whichever result lands first in a
//! single-slot channel: the work's own result, or an abort synthesized when
//! a timeout notification for one of its keys arrives.
//!
//! ```text
//! Pending --work finished--------> Completed
//!    |
//!    +----timeout notification---> Aborted
//! ```
//!
//! Cancellation is advisory: an aborted unit of work keeps running in the
//! background, its eventual result is discarded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dedup::MessageDeduplicator;
use super::keys::{decode_notification, LeaseKey, TimeoutNotification};
use super::pubsub::{BusError, MessageBus};
use crate::metrics::MetricsRegistry;

#[derive(Debug, Error)]
pub enum CancelError {
    /// A lease this work depended on was force-acquired elsewhere.
    #[error("operation timed out")]
    Aborted { key: LeaseKey },

    #[error("unit of work failed: {0:#}")]
    Failed(anyhow::Error),

    #[error("unit of work panicked")]
    Panicked,

    #[error("unit of work was dropped before completing")]
    Lost,
}

impl CancelError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, CancelError::Aborted { .. })
    }
}

/// Handle returned by [`CancellationRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterToken(u64);

/// Something a notification can abort.  Returns `true` if this call decided
/// the outcome.
pub trait Abortable: Send + Sync {
    fn abort(&self, key: &LeaseKey) -> bool;
}

/// Single-slot result holder.  The first `fill` wins; later ones are no-ops.
struct ResultSlot<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T, CancelError>>>>,
}

impl<T> ResultSlot<T> {
    fn new(tx: oneshot::Sender<Result<T, CancelError>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn fill(&self, result: Result<T, CancelError>) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match tx {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

impl<T: Send> Abortable for ResultSlot<T> {
    fn abort(&self, key: &LeaseKey) -> bool {
        self.fill(Err(CancelError::Aborted { key: key.clone() }))
    }
}

struct Waiter {
    keys: Vec<LeaseKey>,
    target: Arc<dyn Abortable>,
}

/// Deregisters on drop, so a caller that is itself cancelled does not leak
/// its registration.
pub(crate) struct Registration<'a> {
    registry: &'a CancellationRegistry,
    token: WaiterToken,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.deregister(self.token);
    }
}

pub struct CancellationRegistry {
    waiters: Mutex<HashMap<WaiterToken, Waiter>>,
    next_token: AtomicU64,
    metrics: MetricsRegistry,
}

impl CancellationRegistry {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            metrics,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WaiterToken, Waiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn waiter_count(&self) -> usize {
        self.lock().len()
    }

    /// Make `target` discoverable by notifications for any of `keys`.
    pub fn register(&self, keys: Vec<LeaseKey>, target: Arc<dyn Abortable>) -> WaiterToken {
        let token = WaiterToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut waiters = self.lock();
        waiters.insert(token, Waiter { keys, target });
        self.metrics.metrics.registered_waiters.set(waiters.len() as i64);
        token
    }

    /// Remove a registration.  Returns `false` if it was already gone.
    pub fn deregister(&self, token: WaiterToken) -> bool {
        let mut waiters = self.lock();
        let removed = waiters.remove(&token).is_some();
        self.metrics.metrics.registered_waiters.set(waiters.len() as i64);
        removed
    }

    /// Make the caller discoverable by notifications for `keys` without
    /// running anything.  The receiver resolves with
    /// [`CancelError::Aborted`] when a matching notification arrives; the
    /// watch ends when the returned registration is dropped.
    pub(crate) fn watch(
        &self,
        keys: Vec<LeaseKey>,
    ) -> (Registration<'_>, oneshot::Receiver<Result<(), CancelError>>) {
        let (tx, rx) = oneshot::channel();
        let registration = Registration {
            registry: self,
            token: self.register(keys, Arc::new(ResultSlot::new(tx))),
        };
        (registration, rx)
    }

    /// Abort every waiter depending on `notification`'s key.  Matched
    /// waiters are deregistered before they are aborted.  Returns the number
    /// of waiters whose outcome this call decided.
    pub fn notify(&self, notification: &TimeoutNotification) -> usize {
        let matched: Vec<Arc<dyn Abortable>> = {
            let mut waiters = self.lock();
            let tokens: Vec<WaiterToken> = waiters
                .iter()
                .filter(|(_, w)| w.keys.contains(notification))
                .map(|(token, _)| *token)
                .collect();
            let matched = tokens
                .iter()
                .filter_map(|token| waiters.remove(token))
                .map(|w| w.target)
                .collect();
            self.metrics.metrics.registered_waiters.set(waiters.len() as i64);
            matched
        };

        let aborted = matched.iter().filter(|t| t.abort(notification)).count();
        if aborted > 0 {
            self.metrics.metrics.waiter_aborts.inc_by(aborted as u64);
            info!(key = %notification, aborted, "aborted waiters on broken lease");
        }
        aborted
    }

    /// Run `work` in the background and wait for its result, unless a
    /// timeout notification for one of `keys` arrives first.
    pub async fn run_interruptable<T, Fut>(
        &self,
        keys: Vec<LeaseKey>,
        work: Fut,
    ) -> Result<T, CancelError>
    where
        T: Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(ResultSlot::new(tx));
        let _registration = Registration {
            registry: self,
            token: self.register(keys, slot.clone()),
        };

        let worker = tokio::spawn(work);
        tokio::spawn(async move {
            let result = match worker.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CancelError::Failed(e)),
                Err(join) if join.is_panic() => Err(CancelError::Panicked),
                Err(_) => Err(CancelError::Lost),
            };
            if !slot.fill(result) {
                debug!("unit of work finished after its caller was released");
            }
        });

        rx.await.unwrap_or(Err(CancelError::Lost))
    }

    /// Subscribe to `topic` and feed every admitted timeout notification to
    /// [`CancellationRegistry::notify`].  The subscription is open when this
    /// returns.
    pub async fn listen(
        self: Arc<Self>,
        bus: Arc<dyn MessageBus>,
        dedup: Arc<MessageDeduplicator>,
        topic: String,
    ) -> Result<JoinHandle<()>, BusError> {
        let mut rx = bus.subscribe(&topic).await?;
        info!(%topic, "listening for lease timeout notifications");

        Ok(tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                let admission = match dedup.admit_on_delivery(&raw).await {
                    Ok(admission) => admission,
                    Err(e) => {
                        warn!(%topic, error = %e, "dropping undeliverable notification");
                        continue;
                    }
                };
                if !admission.admit {
                    continue;
                }
                match decode_notification(&admission.payload) {
                    Ok(notification) => {
                        let aborted = self.notify(&notification);
                        debug!(key = %notification, aborted, "timeout notification delivered");
                    }
                    Err(e) => warn!(%topic, error = %e, "malformed timeout notification"),
                }
            }
            info!(%topic, "timeout notification stream closed");
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn registry() -> Arc<CancellationRegistry> {
        Arc::new(CancellationRegistry::new(MetricsRegistry::new()))
    }

    fn orders(id: &str) -> LeaseKey {
        LeaseKey::new("Orders", id)
    }

    #[tokio::test]
    async fn completed_work_returns_its_result() {
        let registry = registry();
        let result = registry
            .run_interruptable(vec![orders("42")], async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(registry.waiter_count(), 0);
    }

    #[tokio::test]
    async fn failed_work_is_reported() {
        let registry = registry();
        let err = registry
            .run_interruptable(vec![orders("42")], async {
                Err::<(), _>(anyhow::anyhow!("constraint violated"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CancelError::Failed(_)));
        assert!(err.to_string().contains("constraint violated"));
    }

    #[tokio::test]
    async fn panicking_work_is_reported() {
        let registry = registry();
        let err = registry
            .run_interruptable(vec![orders("42")], async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CancelError::Panicked));
        assert_eq!(registry.waiter_count(), 0);
    }

    #[tokio::test]
    async fn notification_aborts_stuck_work() {
        let registry = registry();
        let waiting = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .run_interruptable(vec![orders("41"), orders("42")], async {
                        std::future::pending::<anyhow::Result<()>>().await
                    })
                    .await
            })
        };

        while registry.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.notify(&orders("42")), 1);

        let err = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("waiter was not released")
            .unwrap()
            .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(err.to_string(), "operation timed out");
        assert_eq!(registry.waiter_count(), 0);
    }

    #[tokio::test]
    async fn unrelated_notifications_are_ignored() {
        let registry = registry();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let waiting = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .run_interruptable(vec![orders("42")], async move {
                        let _ = release_rx.await;
                        Ok("done")
                    })
                    .await
            })
        };

        while registry.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.notify(&orders("43")), 0);
        assert_eq!(registry.notify(&LeaseKey::new("Invoices", "42")), 0);

        release_tx.send(()).unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn notification_after_completion_is_a_noop() {
        let registry = registry();
        registry
            .run_interruptable(vec![orders("42")], async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(registry.notify(&orders("42")), 0);
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = registry();
        let (tx, _rx) = oneshot::channel::<Result<(), CancelError>>();
        let token = registry.register(vec![orders("42")], Arc::new(ResultSlot::new(tx)));
        assert!(registry.deregister(token));
        assert!(!registry.deregister(token));
        assert_eq!(registry.waiter_count(), 0);
    }

    #[test]
    fn slot_keeps_first_result() {
        let (tx, mut rx) = oneshot::channel::<Result<u8, CancelError>>();
        let slot = ResultSlot::new(tx);
        assert!(slot.fill(Ok(1)));
        assert!(!slot.abort(&orders("42")));
        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn watch_resolves_on_matching_notification() {
        let registry = registry();
        let (registration, mut aborted) = registry.watch(vec![orders("42")]);
        assert_eq!(registry.waiter_count(), 1);

        assert_eq!(registry.notify(&orders("43")), 0);
        assert!(aborted.try_recv().is_err());

        assert_eq!(registry.notify(&orders("42")), 1);
        let err = aborted.await.unwrap().unwrap_err();
        assert!(matches!(err, CancelError::Aborted { key } if key == orders("42")));
        drop(registration);
        assert_eq!(registry.waiter_count(), 0);
    }

    #[tokio::test]
    async fn dropped_watch_is_not_notified() {
        let registry = registry();
        let (registration, _aborted) = registry.watch(vec![orders("42")]);
        drop(registration);
        assert_eq!(registry.notify(&orders("42")), 0);
    }
}
