//! Presence key schema
//!
//! Format: presence:user:{user_id}

use crate::websocket::connection::UserId;

/// Pub/Sub channel carrying [`StatusUpdate`](super::StatusUpdate) events.
pub const STATUS_CHANNEL: &str = "presence:status";

pub struct PresenceKey;

impl PresenceKey {
    pub fn user(user_id: UserId) -> String {
        format!("presence:user:{}", user_id)
    }
}
