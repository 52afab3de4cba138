//! Re-delivery suppression for bus messages.
//!
//! Publishers prefix each payload with a fingerprint.  On delivery, each
//! consumer records `(consumer, fingerprint)` in the store with a
//! conditional write; only the delivery that creates the marker is
//! admitted.  Markers are scoped per consumer so a broadcast still reaches
//! every process exactly once.  A publisher claims its own marker before
//! publishing, so it never consumes its own messages.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::failover::FailoverGuard;
use super::pubsub::{BusError, MessageBus};
use super::store::StoreError;
use crate::config::{DedupConfig, DeliveryFailureMode};
use crate::metrics::MetricsRegistry;

const SEPARATOR: char = '|';

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("message carries no delivery fingerprint")]
    Malformed,

    #[error("failed to record delivery marker: {0}")]
    StoreFailure(#[source] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Outcome of a delivery: the stripped payload and whether to process it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub payload: String,
    pub admit: bool,
}

pub struct MessageDeduplicator {
    guard: Arc<FailoverGuard>,
    key_prefix: String,
    consumer_id: String,
    failure_mode: DeliveryFailureMode,
    metrics: MetricsRegistry,
}

/// Fingerprint of a message published on `topic` at `timestamp_nanos`.
pub fn fingerprint(topic: &str, timestamp_nanos: i64, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(timestamp_nanos.to_be_bytes());
    hasher.update(payload.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// Split a tagged message into `(fingerprint, payload)`.
fn split_tagged(tagged: &str) -> Option<(&str, &str)> {
    let (fingerprint, payload) = tagged.split_once(SEPARATOR)?;
    if fingerprint.is_empty() || !fingerprint.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some((fingerprint, payload))
}

impl MessageDeduplicator {
    pub fn new(
        guard: Arc<FailoverGuard>,
        config: &DedupConfig,
        consumer_id: impl Into<String>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            guard,
            key_prefix: config.key_prefix.clone(),
            consumer_id: consumer_id.into(),
            failure_mode: config.delivery_failure_mode,
            metrics,
        }
    }

    fn marker_key(&self, fingerprint: &str) -> String {
        format!("{}-dedup-{}-{fingerprint}", self.key_prefix, self.consumer_id)
    }

    /// Tag `payload` for publication on `topic`.
    pub fn prepare_for_publish(&self, topic: &str, payload: &str) -> String {
        let now = chrono::Utc::now();
        let nanos = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000));
        format!("{}{SEPARATOR}{payload}", fingerprint(topic, nanos, payload))
    }

    /// Tag `payload`, claim this consumer's marker for it, and publish.
    ///
    /// Fails without publishing if the marker cannot be written.
    pub async fn publish(
        &self,
        bus: &dyn MessageBus,
        topic: &str,
        payload: &str,
    ) -> Result<(), DedupError> {
        let tagged = self.prepare_for_publish(topic, payload);
        self.publish_tagged(bus, topic, &tagged).await
    }

    async fn publish_tagged(
        &self,
        bus: &dyn MessageBus,
        topic: &str,
        tagged: &str,
    ) -> Result<(), DedupError> {
        let (fingerprint, _) = split_tagged(tagged).ok_or(DedupError::Malformed)?;
        let stamp = chrono::Utc::now().timestamp().to_string();
        let claimed = self
            .guard
            .set_if_absent(&self.marker_key(fingerprint), &stamp)
            .await
            .map_err(DedupError::StoreFailure)?;
        if !claimed {
            // Only a fingerprint collision gets here; our own delivery is
            // suppressed either way.
            debug!(%fingerprint, %topic, "publisher marker already present");
        }
        bus.publish(topic, tagged).await?;
        Ok(())
    }

    /// Decide whether a delivered message is its first delivery.
    pub async fn admit_on_delivery(&self, tagged: &str) -> Result<Admission, DedupError> {
        let (fingerprint, payload) = split_tagged(tagged).ok_or(DedupError::Malformed)?;
        let marker = self.marker_key(fingerprint);
        let stamp = chrono::Utc::now().timestamp().to_string();

        match self.guard.set_if_absent(&marker, &stamp).await {
            Ok(true) => {
                self.metrics.metrics.dedup_admitted.inc();
                Ok(Admission {
                    payload: payload.to_string(),
                    admit: true,
                })
            }
            Ok(false) => {
                self.metrics.metrics.dedup_suppressed.inc();
                debug!(%fingerprint, "suppressed re-delivered message");
                Ok(Admission {
                    payload: payload.to_string(),
                    admit: false,
                })
            }
            Err(e) => match self.failure_mode {
                DeliveryFailureMode::FailOpen => {
                    warn!(%fingerprint, error = %e, "dedup marker write failed, admitting anyway");
                    self.metrics.metrics.dedup_admitted.inc();
                    Ok(Admission {
                        payload: payload.to_string(),
                        admit: true,
                    })
                }
                DeliveryFailureMode::FailClosed => {
                    warn!(%fingerprint, error = %e, "dedup marker write failed, dropping message");
                    Err(DedupError::StoreFailure(e))
                }
            },
        }
    }
}
