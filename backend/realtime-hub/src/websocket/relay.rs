//! Cross-instance fan-out over Redis Pub/Sub
//!
//! Every instance publishes the broadcasts it performs; every other instance
//! replays them against its own local connections. Envelopes carry the
//! publishing instance id so nobody re-delivers its own traffic.

use super::broadcast::Broadcaster;
use super::connection::{ChannelId, UserId};
use crate::error::{BroadcastError, RelayError};
use crate::metrics;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

pub const DEFAULT_RELAY_CHANNEL: &str = "hub:relay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RelayTarget {
    Channel(ChannelId),
    User(UserId),
    Users(Vec<UserId>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: String,
    pub target: RelayTarget,
    /// Base64 of the opaque payload bytes.
    pub payload: String,
}

impl RelayEnvelope {
    pub fn new(origin: &str, target: RelayTarget, payload: &[u8]) -> Self {
        Self {
            origin: origin.to_string(),
            target,
            payload: STANDARD.encode(payload),
        }
    }

    pub fn decode_payload(&self) -> Result<Bytes, RelayError> {
        Ok(Bytes::from(STANDARD.decode(self.payload.as_bytes())?))
    }
}

#[async_trait]
pub trait Relay: Send + Sync {
    /// Identifier of this instance, stamped on every published envelope.
    fn origin(&self) -> &str;

    async fn publish(&self, target: RelayTarget, payload: Bytes) -> Result<(), RelayError>;
}

/// Replay an envelope from another instance against local connections only.
///
/// Returns `Ok(None)` for envelopes published by `local_origin`.
pub async fn apply_envelope(
    broadcaster: &Broadcaster,
    local_origin: &str,
    envelope: RelayEnvelope,
) -> Result<Option<usize>, RelayError> {
    if envelope.origin == local_origin {
        return Ok(None);
    }

    let payload = envelope.decode_payload()?;
    let result = match &envelope.target {
        RelayTarget::Channel(channel_id) => {
            broadcaster.deliver_local_channel(*channel_id, payload).await
        }
        RelayTarget::User(user_id) => broadcaster.deliver_local_user(*user_id, payload).await,
        RelayTarget::Users(user_ids) => broadcaster.deliver_local_users(user_ids, payload).await,
    };

    match result {
        Ok(delivered) => Ok(Some(delivered)),
        Err(e) => {
            tracing::debug!(
                origin = %envelope.origin,
                error = %e,
                "relayed delivery partially failed"
            );
            let BroadcastError::Delivery { delivered, .. } = e;
            Ok(Some(delivered))
        }
    }
}

/// Redis Pub/Sub relay
#[derive(Clone)]
pub struct RedisRelay {
    client: Client,
    publisher: ConnectionManager,
    origin: String,
    channel: String,
}

impl RedisRelay {
    pub fn new(client: Client, publisher: ConnectionManager, origin: String) -> Self {
        Self {
            client,
            publisher,
            origin,
            channel: DEFAULT_RELAY_CHANNEL.to_string(),
        }
    }

    pub fn with_channel(mut self, channel: String) -> Self {
        self.channel = channel;
        self
    }

    /// Subscribe and replay envelopes from other instances through
    /// `broadcaster`'s local delivery path.
    pub async fn spawn_listener(
        &self,
        broadcaster: Broadcaster,
    ) -> Result<JoinHandle<()>, RelayError> {
        // PubSub requires a dedicated connection, not multiplexed
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        tracing::info!(
            channel = %self.channel,
            origin = %self.origin,
            "subscribed to relay channel"
        );

        let origin = self.origin.clone();
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();

            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        metrics::record_relay_error("payload");
                        tracing::error!(error = ?e, "failed to read relay payload");
                        continue;
                    }
                };

                let envelope: RelayEnvelope = match serde_json::from_str(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        metrics::record_relay_error("deserialize");
                        tracing::error!(error = ?e, "failed to deserialize relay envelope");
                        continue;
                    }
                };

                if let Err(e) = apply_envelope(&broadcaster, &origin, envelope).await {
                    metrics::record_relay_error("apply");
                    tracing::warn!(error = %e, "failed to apply relay envelope");
                }
            }

            tracing::warn!("relay subscription ended");
        });

        Ok(handle)
    }
}

#[async_trait]
impl Relay for RedisRelay {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn publish(&self, target: RelayTarget, payload: Bytes) -> Result<(), RelayError> {
        let envelope = RelayEnvelope::new(&self.origin, target, &payload);
        let body = serde_json::to_string(&envelope)?;

        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(&self.channel, body).await?;
        tracing::trace!(receivers, "relay envelope published");
        Ok(())
    }
}
