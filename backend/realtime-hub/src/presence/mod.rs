//! Presence tracking
//!
//! Online/offline status lives in a TTL store shared by every instance so a
//! crashed instance's users decay to offline on their own. Status flips are
//! pushed to local connections directly and to other instances through a
//! [`StatusBus`].

pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use memory::{MemoryPresenceStore, MemoryStatusBus};
pub use redis_store::{RedisPresenceStore, RedisStatusBus};
pub use store::{PresenceStore, StatusBus};

use crate::error::{PresenceError, PresenceResult};
use crate::metrics;
use crate::websocket::connection::UserId;
use crate::websocket::message_types::ServerEvent;
use crate::websocket::{ConnectionRegistry, HubEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = PresenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(PresenceError::InvalidValue(other.to_string())),
        }
    }
}

/// Status change announced to other instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub user_id: UserId,
    pub status: PresenceStatus,
    /// Instance that produced the change.
    pub origin: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(user_id: UserId, status: PresenceStatus, origin: impl Into<String>) -> Self {
        Self {
            user_id,
            status,
            origin: origin.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub online_ttl: Duration,
    pub offline_ttl: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            online_ttl: Duration::from_secs(300),
            offline_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    bus: Option<Arc<dyn StatusBus>>,
    registry: ConnectionRegistry,
    origin: String,
    settings: PresenceSettings,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        registry: ConnectionRegistry,
        origin: impl Into<String>,
        settings: PresenceSettings,
    ) -> Self {
        Self {
            store,
            bus: None,
            registry,
            origin: origin.into(),
            settings,
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn StatusBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub async fn set_online(&self, user_id: UserId) -> PresenceResult<()> {
        self.set_status(user_id, PresenceStatus::Online, self.settings.online_ttl)
            .await
    }

    pub async fn set_offline(&self, user_id: UserId) -> PresenceResult<()> {
        self.set_status(user_id, PresenceStatus::Offline, self.settings.offline_ttl)
            .await
    }

    /// Record the status, notify local connections, then other instances.
    ///
    /// The local fan-out runs even when the store write fails; the store
    /// error is returned afterwards.
    async fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        ttl: Duration,
    ) -> PresenceResult<()> {
        let stored = self.store.set_status(user_id, status, ttl).await;
        if let Err(e) = &stored {
            metrics::record_presence_error("set_status");
            warn!(user_id, status = %status, error = %e, "failed to write presence");
        }

        let update = StatusUpdate::new(user_id, status, self.origin.clone());
        self.fan_out_local(&update).await;

        if let Err(e) = self.publish_status_update(&update).await {
            metrics::record_presence_error("publish");
            warn!(user_id, status = %status, error = %e, "failed to publish status update");
        }

        stored
    }

    /// Refresh the online TTL and the connection's activity timestamp.
    pub async fn heartbeat(&self, user_id: UserId) -> PresenceResult<()> {
        self.registry.index().update_last_activity(user_id).await;
        self.store
            .set_status(user_id, PresenceStatus::Online, self.settings.online_ttl)
            .await
            .map_err(|e| {
                metrics::record_presence_error("heartbeat");
                e
            })
    }

    /// Subset of `user_ids` whose record reads `online`, in input order.
    pub async fn get_online_friends(&self, user_ids: &[UserId]) -> PresenceResult<Vec<UserId>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let statuses = self
            .store
            .get_statuses(user_ids)
            .await
            .map_err(|e| {
                metrics::record_presence_error("get_statuses");
                e
            })?;

        Ok(user_ids
            .iter()
            .zip(statuses)
            .filter(|(_, status)| *status == Some(PresenceStatus::Online))
            .map(|(user_id, _)| *user_id)
            .collect())
    }

    pub async fn status(&self, user_id: UserId) -> PresenceResult<Option<PresenceStatus>> {
        let statuses = self.store.get_statuses(&[user_id]).await?;
        Ok(statuses.into_iter().next().flatten())
    }

    /// Hand `update` to the status bus. Without a bus this is a no-op.
    pub async fn publish_status_update(&self, update: &StatusUpdate) -> PresenceResult<()> {
        match &self.bus {
            Some(bus) => bus.publish(update).await,
            None => Ok(()),
        }
    }

    /// Apply status updates from other instances to local connections.
    pub async fn subscribe_to_status_updates(&self) -> PresenceResult<JoinHandle<()>> {
        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| PresenceError::Unavailable("no status bus configured".to_string()))?;
        let mut updates = bus.subscribe().await?;

        let tracker = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                if update.origin == tracker.origin {
                    continue;
                }
                debug!(
                    user_id = update.user_id,
                    status = %update.status,
                    origin = %update.origin,
                    "applying remote status update"
                );
                tracker.fan_out_local(&update).await;
            }
            warn!("status update stream ended");
        }))
    }

    /// Drive presence from registry lifecycle events.
    pub fn spawn_lifecycle_listener(&self) -> JoinHandle<()> {
        let mut events = self.registry.subscribe_events();
        let tracker = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                // Errors are already logged and counted
                let _ = tracker.handle_event(event).await;
            }
            info!("hub event stream closed, presence listener stopping");
        })
    }

    /// `Registered` marks the user online. `Unregistered` marks them offline
    /// unless another connection for the same user is attached by now.
    pub async fn handle_event(&self, event: HubEvent) -> PresenceResult<()> {
        match event {
            HubEvent::Registered { user_id, .. } => self.set_online(user_id).await,
            HubEvent::Unregistered { user_id, .. } => {
                if self.registry.index().is_user_online(user_id).await {
                    debug!(user_id, "user reconnected, keeping presence online");
                    return Ok(());
                }
                self.set_offline(user_id).await
            }
        }
    }

    async fn fan_out_local(&self, update: &StatusUpdate) {
        let event = ServerEvent::PresenceStatus {
            user_id: update.user_id,
            status: update.status,
            timestamp: update.timestamp,
        };
        match event.to_payload() {
            Ok(payload) => {
                let delivered = self.registry.broadcast_except(update.user_id, payload).await;
                debug!(user_id = update.user_id, delivered, "status fanned out locally");
            }
            Err(e) => warn!(error = %e, "failed to encode presence event"),
        }
    }
}
