use super::{PresenceStatus, StatusUpdate};
use crate::error::PresenceResult;
use crate::websocket::connection::UserId;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// TTL-based presence records in a shared key-value store.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        ttl: Duration,
    ) -> PresenceResult<()>;

    /// Batched lookup, one entry per input id in input order. A missing or
    /// expired record is `None`.
    async fn get_statuses(&self, user_ids: &[UserId])
        -> PresenceResult<Vec<Option<PresenceStatus>>>;
}

/// Publish/subscribe channel for cross-instance status propagation.
#[async_trait]
pub trait StatusBus: Send + Sync {
    async fn publish(&self, update: &StatusUpdate) -> PresenceResult<()>;

    /// Start receiving updates. The subscription ends when the receiver is
    /// dropped.
    async fn subscribe(&self) -> PresenceResult<mpsc::Receiver<StatusUpdate>>;
}
