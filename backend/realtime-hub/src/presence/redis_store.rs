use super::keys::{PresenceKey, STATUS_CHANNEL};
use super::store::{PresenceStore, StatusBus};
use super::{PresenceStatus, StatusUpdate};
use crate::error::{PresenceError, PresenceResult};
use crate::websocket::connection::UserId;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Pipeline};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const SUBSCRIPTION_BUFFER: usize = 1024;

/// Presence records as `SET key value EX ttl`.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
}

impl RedisPresenceStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        ttl: Duration,
    ) -> PresenceResult<()> {
        let key = PresenceKey::user(user_id);
        let ttl_secs = ttl.as_secs().max(1);

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(&key, status.as_str(), ttl_secs)
            .await?;

        debug!(key = %key, status = %status, ttl = ttl_secs, "presence set");
        Ok(())
    }

    async fn get_statuses(
        &self,
        user_ids: &[UserId],
    ) -> PresenceResult<Vec<Option<PresenceStatus>>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        // One round trip for the whole batch
        let mut pipe = Pipeline::new();
        for user_id in user_ids {
            pipe.get(PresenceKey::user(*user_id));
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        Ok(values
            .into_iter()
            .map(|value| value.and_then(|v| v.parse::<PresenceStatus>().ok()))
            .collect())
    }
}

/// Status updates over `PUBLISH presence:status`.
#[derive(Clone)]
pub struct RedisStatusBus {
    client: Client,
    publisher: ConnectionManager,
    channel: String,
}

impl RedisStatusBus {
    pub fn new(client: Client, publisher: ConnectionManager) -> Self {
        Self {
            client,
            publisher,
            channel: STATUS_CHANNEL.to_string(),
        }
    }
}

#[async_trait]
impl StatusBus for RedisStatusBus {
    async fn publish(&self, update: &StatusUpdate) -> PresenceResult<()> {
        let payload = serde_json::to_string(update)?;

        let mut conn = self.publisher.clone();
        let subscribers: usize = conn.publish(&self.channel, payload).await?;

        debug!(
            user_id = update.user_id,
            status = %update.status,
            subscribers,
            "status update published"
        );
        Ok(())
    }

    async fn subscribe(&self) -> PresenceResult<mpsc::Receiver<StatusUpdate>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(PresenceError::Redis)?;
        pubsub.subscribe(&self.channel).await?;

        info!(channel = %self.channel, "subscribed to status updates");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();

            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = ?e, "failed to read status update payload");
                        continue;
                    }
                };

                let update: StatusUpdate = match serde_json::from_str(&payload) {
                    Ok(u) => u,
                    Err(e) => {
                        error!(
                            error = ?e,
                            payload = %payload,
                            "failed to deserialize status update"
                        );
                        continue;
                    }
                };

                if tx.send(update).await.is_err() {
                    debug!("status update receiver dropped");
                    return;
                }
            }

            warn!("status update subscription ended");
        });

        Ok(rx)
    }
}
