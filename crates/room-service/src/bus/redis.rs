//! Redis pub/sub event bus.
//!
//! Each topic maps to a channel of the same name. Payloads are JSON strings.
//! Each subscription holds its own pub/sub connection.

use crate::bus::{EventBus, Subscription, Topic, SUBSCRIPTION_BUFFER};
use crate::errors::BusError;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct RedisEventBus {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisEventBus {
    /// # Errors
    ///
    /// Returns `BusError::Backend` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = Client::open(redis_url).map_err(|e| {
            error!(target: "rs.bus.redis", error = %e, "Failed to open Redis client");
            BusError::Backend(format!("Failed to open Redis client: {e}"))
        })?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, connection })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, topic: Topic, payload: serde_json::Value) -> Result<(), BusError> {
        let encoded = serde_json::to_string(&payload)?;
        let mut conn = self.connection.clone();
        let receivers: i64 = conn.publish(topic.as_str(), encoded).await?;
        debug!(target: "rs.bus.redis", topic = topic.as_str(), receivers, "Published event");
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic.as_str()).await?;
        info!(target: "rs.bus.redis", topic = topic.as_str(), "Subscribed");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    () = stop.cancelled() => break,
                    msg = messages.next() => msg,
                };
                let Some(msg) = msg else {
                    warn!(target: "rs.bus.redis", topic = topic.as_str(), "Pub/sub stream ended");
                    break;
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(target: "rs.bus.redis", error = %e, "Invalid pub/sub payload");
                        continue;
                    }
                };
                match serde_json::from_str::<serde_json::Value>(&payload) {
                    Ok(value) => {
                        if tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            target: "rs.bus.redis",
                            topic = topic.as_str(),
                            error = %e,
                            "Failed to parse event"
                        );
                    }
                }
            }
        });

        Ok(Subscription::new(rx, cancel))
    }
}
