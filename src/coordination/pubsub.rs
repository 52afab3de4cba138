use async_trait::async_trait;
use fred::clients::SubscriberClient;
use fred::interfaces::{ClientLike, EventInterface, PubsubInterface};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish on {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// Publish/subscribe transport.  Delivery is at-least-once: subscribers may
/// see duplicates and ordering is not guaranteed.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError>;

    /// Open a subscription.  The subscription ends when the receiver is
    /// dropped.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, BusError>;
}

// ---------------------------------------------------------------------------
// KeyDB
// ---------------------------------------------------------------------------

/// [`MessageBus`] over KeyDB PUBLISH / SUBSCRIBE.
///
/// Publishing goes through `pool.next()` since `Pool` does not implement
/// `PubsubInterface` in fred v10.  Each subscription gets a dedicated
/// `SubscriberClient` built from the pool's config.
#[derive(Clone)]
pub struct KeyDbBus {
    pool: fred::clients::Pool,
}

impl KeyDbBus {
    pub fn new(pool: fred::clients::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageBus for KeyDbBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        let _: () = self
            .pool
            .next()
            .publish(topic, payload)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        debug!(%topic, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, BusError> {
        let subscribe_err = |e: fred::error::Error| BusError::Subscribe {
            topic: topic.to_string(),
            reason: e.to_string(),
        };

        let client = self.pool.next();
        let subscriber = SubscriberClient::new(
            client.client_config(),
            None,
            None,
            client.client_reconnect_policy(),
        );
        let _connect = subscriber.connect();
        subscriber.wait_for_connect().await.map_err(subscribe_err)?;
        subscriber.subscribe(topic).await.map_err(subscribe_err)?;

        // Bridge the broadcast-based message stream into a bounded channel.
        let (tx, rx) = mpsc::channel::<String>(64);
        let channel = topic.to_string();
        tokio::spawn(async move {
            let mut message_stream = subscriber.message_rx();
            loop {
                let msg = match message_stream.recv().await {
                    Ok(msg) => msg,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%channel, skipped, "subscriber lagged, messages dropped");
                        continue;
                    }
                    Err(_) => break,
                };
                let Some(payload) = msg.value.as_str() else {
                    continue;
                };
                if tx.send(payload.to_string()).await.is_err() {
                    break;
                }
            }
            let _ = subscriber.unsubscribe(&channel).await;
            let _ = subscriber.quit().await;
            debug!(%channel, "subscription closed");
        });

        Ok(rx)
    }
}
