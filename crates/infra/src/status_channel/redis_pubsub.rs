//! Redis pub/sub-backed status channel (optional).
//!
//! One Redis channel per subject (`docqueue:status:<subject>`), so worker and API
//! processes share events without any of them filtering. Redis pub/sub is not
//! durable, which matches the channel contract: no replay, best effort.
//!
//! Publishing shares one multiplexed connection. It does not reconnect on its own,
//! so a publish that fails drops it and is retried once on a fresh connection.

use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use docqueue_core::SubjectId;
use docqueue_events::{ChannelError, StatusChannel, StatusEvent, Subscription};

pub const CHANNEL_PREFIX: &str = "docqueue:status:";

/// How often an idle subscriber thread checks whether its subscription was dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

pub fn channel_name(subject_id: &SubjectId) -> String {
    format!("{CHANNEL_PREFIX}{subject_id}")
}

pub struct RedisStatusChannel {
    client: redis::Client,
    publisher: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisStatusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStatusChannel")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl RedisStatusChannel {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, ChannelError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
        })
    }

    async fn publisher(&self) -> Result<redis::aio::MultiplexedConnection, ChannelError> {
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn publish_once(&self, channel: &str, payload: &str) -> Result<i64, ChannelError> {
        let mut conn = self.publisher().await?;
        conn.publish(channel, payload)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}

#[async_trait]
impl StatusChannel for RedisStatusChannel {
    async fn publish(&self, event: StatusEvent) -> Result<(), ChannelError> {
        let payload =
            serde_json::to_string(&event).map_err(|e| ChannelError::Serialize(e.to_string()))?;

        let channel = channel_name(&event.subject_id);
        let receivers = match self.publish_once(&channel, &payload).await {
            Ok(receivers) => receivers,
            Err(e) => {
                debug!(channel = %channel, error = %e, "redis publisher dropped, reconnecting");
                *self.publisher.lock().await = None;
                self.publish_once(&channel, &payload).await?
            }
        };

        debug!(subject_id = %event.subject_id, receivers, "status event published");
        Ok(())
    }

    fn subscribe(&self, subject_id: &SubjectId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = self.client.clone();
        let channel = channel_name(subject_id);

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(channel = %channel, error = %e, "redis subscribe connection failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.subscribe(&channel) {
                warn!(channel = %channel, error = %e, "redis subscribe failed");
                return;
            }
            if pubsub.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(e) if e.is_timeout() => {
                        if tx.is_closed() {
                            return;
                        }
                        continue;
                    }
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let event: StatusEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(_) => continue,
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
        });

        Subscription::new(subject_id.clone(), rx)
    }
}
