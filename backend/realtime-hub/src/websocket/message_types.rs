use super::connection::{ChannelId, UserId};
use crate::presence::PresenceStatus;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsInboundEvent {
    Subscribe { channel_id: ChannelId },
    Unsubscribe { channel_id: ChannelId },
    Heartbeat,
}

/// Events generated by the hub itself, following the "object.action" naming.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "presence.status")]
    PresenceStatus {
        user_id: UserId,
        status: PresenceStatus,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "channel.subscribed")]
    Subscribed { channel_id: ChannelId },

    #[serde(rename = "channel.unsubscribed")]
    Unsubscribed { channel_id: ChannelId },

    #[serde(rename = "heartbeat.ack")]
    HeartbeatAck,

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

/// Chat message as produced by the application layer.
///
/// The engine never inspects payloads; this is the shape collaborators
/// serialize before calling a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    pub sender_id: UserId,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatPayload {
    pub fn for_channel(channel_id: ChannelId, sender_id: UserId, body: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id),
            recipient_id: None,
            sender_id,
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_user(recipient_id: UserId, sender_id: UserId, body: impl Into<String>) -> Self {
        Self {
            channel_id: None,
            recipient_id: Some(recipient_id),
            sender_id,
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}
