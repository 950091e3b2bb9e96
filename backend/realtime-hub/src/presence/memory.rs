//! In-process presence backends for single-instance deployments and tests.

use super::store::{PresenceStore, StatusBus};
use super::{PresenceStatus, StatusUpdate};
use crate::error::PresenceResult;
use crate::websocket::connection::UserId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

const BUS_CAPACITY: usize = 1024;

/// TTL map keyed by user id. Expiry follows the tokio clock, so paused-time
/// tests can advance past a TTL deterministically.
#[derive(Default)]
pub struct MemoryPresenceStore {
    records: Mutex<HashMap<UserId, (PresenceStatus, Instant)>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired records.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        records.retain(|_, (_, expires_at)| *expires_at > now);
        records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_status(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        ttl: Duration,
    ) -> PresenceResult<()> {
        let expires_at = Instant::now() + ttl;
        self.records
            .lock()
            .await
            .insert(user_id, (status, expires_at));
        Ok(())
    }

    async fn get_statuses(
        &self,
        user_ids: &[UserId],
    ) -> PresenceResult<Vec<Option<PresenceStatus>>> {
        let now = Instant::now();
        let records = self.records.lock().await;
        Ok(user_ids
            .iter()
            .map(|user_id| match records.get(user_id) {
                Some((status, expires_at)) if *expires_at > now => Some(*status),
                _ => None,
            })
            .collect())
    }
}

/// Status bus over a `tokio::sync::broadcast` channel.
pub struct MemoryStatusBus {
    sender: broadcast::Sender<StatusUpdate>,
}

impl MemoryStatusBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }
}

impl Default for MemoryStatusBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusBus for MemoryStatusBus {
    async fn publish(&self, update: &StatusUpdate) -> PresenceResult<()> {
        // No subscribers is fine
        let _ = self.sender.send(update.clone());
        Ok(())
    }

    async fn subscribe(&self) -> PresenceResult<mpsc::Receiver<StatusUpdate>> {
        let mut source = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(update) => {
                        if tx.send(update).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "status bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_records_expire() {
        let store = MemoryPresenceStore::new();
        store
            .set_status(1, PresenceStatus::Online, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            store.get_statuses(&[1, 2]).await.unwrap(),
            vec![Some(PresenceStatus::Online), None]
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get_statuses(&[1]).await.unwrap(), vec![None]);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = MemoryStatusBus::new();
        let mut rx = bus.subscribe().await.unwrap();

        let update = StatusUpdate::new(5, PresenceStatus::Offline, "node-a");
        bus.publish(&update).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.user_id, 5);
        assert_eq!(received.status, PresenceStatus::Offline);
        assert_eq!(received.origin, "node-a");
    }
}
