//! Broadcast engine
//!
//! Resolves a logical target through the membership index and writes the
//! payload to every resolved connection concurrently. Cost is proportional to
//! the target's size, never to the total number of connections.

use super::connection::{ChannelId, Connection, UserId};
use super::relay::{Relay, RelayTarget};
use super::ConnectionRegistry;
use crate::error::{BroadcastError, ConnectionError};
use crate::metrics;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_CONCURRENCY: usize = 256;

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub write_timeout: Duration,
    /// Maximum number of writes in flight for one broadcast call.
    pub concurrency: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Result of delivering one payload to a resolved recipient set.
#[derive(Debug, Default)]
pub struct DeliveryOutcome {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Recipients that were already leaving when the write was attempted.
    pub skipped: usize,
    pub last_error: Option<ConnectionError>,
}

impl DeliveryOutcome {
    pub fn into_result(self) -> Result<usize, BroadcastError> {
        match self.last_error {
            Some(last) if self.failed > 0 => Err(BroadcastError::Delivery {
                attempted: self.attempted,
                delivered: self.delivered,
                failed: self.failed,
                last,
            }),
            _ => Ok(self.delivered),
        }
    }
}

/// Write `payload` to every target and detach the ones that fail.
///
/// Failed connections leave the registry and index before this returns, so
/// the next broadcast cannot resolve them again; closing their transports
/// happens on a background task.
pub(crate) async fn deliver(
    registry: &ConnectionRegistry,
    targets: Vec<Arc<Connection>>,
    payload: Bytes,
    write_timeout: Duration,
    concurrency: usize,
    target_kind: &'static str,
) -> DeliveryOutcome {
    let mut outcome = DeliveryOutcome {
        attempted: targets.len(),
        ..Default::default()
    };
    if targets.is_empty() {
        return outcome;
    }

    let started = Instant::now();
    let results: Vec<(Arc<Connection>, Result<(), ConnectionError>)> = stream::iter(targets)
        .map(|conn| {
            let payload = payload.clone();
            async move {
                let result = conn.write(payload, write_timeout).await;
                (conn, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut failed = Vec::new();
    for (conn, result) in results {
        match result {
            Ok(()) => outcome.delivered += 1,
            Err(ConnectionError::NotActive) => outcome.skipped += 1,
            Err(e) => {
                tracing::warn!(
                    user_id = conn.user_id(),
                    connection_id = %conn.id(),
                    error = %e,
                    "delivery failed, unregistering connection"
                );
                outcome.failed += 1;
                outcome.last_error = Some(e);
                failed.push(conn);
            }
        }
    }

    for conn in failed {
        if registry.detach(&conn).await {
            registry.close_in_background(conn);
        }
    }

    metrics::record_delivery(
        target_kind,
        outcome.delivered,
        outcome.failed,
        started.elapsed(),
    );
    outcome
}

/// Fan-out entry point used by the application layer.
#[derive(Clone)]
pub struct Broadcaster {
    registry: ConnectionRegistry,
    relay: Option<Arc<dyn Relay>>,
    settings: BroadcastSettings,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry, settings: BroadcastSettings) -> Self {
        Self {
            registry,
            relay: None,
            settings,
        }
    }

    /// Also hand every broadcast to `relay` for delivery on other instances.
    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Deliver to every online member of `channel_id`.
    ///
    /// A channel without online members is a successful no-op. When some
    /// writes fail the others still complete and the call returns
    /// [`BroadcastError::Delivery`].
    pub async fn broadcast_to_channel(
        &self,
        channel_id: ChannelId,
        payload: impl Into<Bytes>,
    ) -> Result<usize, BroadcastError> {
        let payload = payload.into();
        let result = self.deliver_local_channel(channel_id, payload.clone()).await;
        self.propagate(RelayTarget::Channel(channel_id), payload).await;
        result
    }

    /// Deliver to one user. Offline users are a successful no-op.
    pub async fn broadcast_to_user(
        &self,
        user_id: UserId,
        payload: impl Into<Bytes>,
    ) -> Result<usize, BroadcastError> {
        let payload = payload.into();
        let result = self.deliver_local_user(user_id, payload.clone()).await;
        self.propagate(RelayTarget::User(user_id), payload).await;
        result
    }

    /// Deliver to each listed user that is online; unknown ids are skipped.
    pub async fn broadcast_to_users(
        &self,
        user_ids: &[UserId],
        payload: impl Into<Bytes>,
    ) -> Result<usize, BroadcastError> {
        let payload = payload.into();
        let result = self.deliver_local_users(user_ids, payload.clone()).await;
        if !user_ids.is_empty() {
            self.propagate(RelayTarget::Users(user_ids.to_vec()), payload)
                .await;
        }
        result
    }

    pub async fn deliver_local_channel(
        &self,
        channel_id: ChannelId,
        payload: Bytes,
    ) -> Result<usize, BroadcastError> {
        let targets = self
            .registry
            .index()
            .connections_in_channel(channel_id)
            .await;
        tracing::debug!(channel_id, recipients = targets.len(), "broadcasting to channel");
        self.deliver(targets, payload, "channel").await
    }

    pub async fn deliver_local_user(
        &self,
        user_id: UserId,
        payload: Bytes,
    ) -> Result<usize, BroadcastError> {
        let targets: Vec<_> = self
            .registry
            .index()
            .connection(user_id)
            .await
            .into_iter()
            .collect();
        self.deliver(targets, payload, "user").await
    }

    pub async fn deliver_local_users(
        &self,
        user_ids: &[UserId],
        payload: Bytes,
    ) -> Result<usize, BroadcastError> {
        let targets = self.registry.index().connections_for(user_ids).await;
        self.deliver(targets, payload, "users").await
    }

    async fn deliver(
        &self,
        targets: Vec<Arc<Connection>>,
        payload: Bytes,
        target_kind: &'static str,
    ) -> Result<usize, BroadcastError> {
        deliver(
            &self.registry,
            targets,
            payload,
            self.settings.write_timeout,
            self.settings.concurrency,
            target_kind,
        )
        .await
        .into_result()
    }

    /// Cross-instance step. Failures degrade to local-only delivery.
    async fn propagate(&self, target: RelayTarget, payload: Bytes) {
        let Some(relay) = &self.relay else {
            return;
        };
        if let Err(e) = relay.publish(target, payload).await {
            metrics::record_relay_error("publish");
            tracing::warn!(error = %e, "cross-instance relay unavailable, delivered locally only");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::websocket::connection::ChannelTransport;
    use crate::websocket::membership::MembershipIndex;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct FailingRelay;

    #[async_trait]
    impl Relay for FailingRelay {
        fn origin(&self) -> &str {
            "test"
        }

        async fn publish(&self, _target: RelayTarget, _payload: Bytes) -> Result<(), RelayError> {
            Err(RelayError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }
    }

    #[derive(Default)]
    struct RecordingRelay {
        published: Mutex<Vec<RelayTarget>>,
    }

    #[async_trait]
    impl Relay for RecordingRelay {
        fn origin(&self) -> &str {
            "test"
        }

        async fn publish(&self, target: RelayTarget, _payload: Bytes) -> Result<(), RelayError> {
            self.published.lock().await.push(target);
            Ok(())
        }
    }

    async fn setup() -> Broadcaster {
        let registry = ConnectionRegistry::new(Arc::new(MembershipIndex::new()));
        Broadcaster::new(registry, BroadcastSettings::default())
    }

    #[tokio::test]
    async fn test_empty_channel_is_ok() {
        let broadcaster = setup().await;
        assert_eq!(broadcaster.broadcast_to_channel(5, "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_user_is_ok() {
        let broadcaster = setup().await;
        assert_eq!(broadcaster.broadcast_to_user(5, "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relay_failure_does_not_fail_delivery() {
        let broadcaster = setup().await.with_relay(Arc::new(FailingRelay));
        let (transport, mut rx) = ChannelTransport::pair();
        let conn = Arc::new(Connection::new(1, transport));
        broadcaster.registry().register(conn).await.unwrap();
        broadcaster.registry().index().add_user_to_channel(1, 9).await;

        let delivered = broadcaster.broadcast_to_channel(9, "hello").await.unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_relay_receives_targets() {
        let relay = Arc::new(RecordingRelay::default());
        let broadcaster = setup().await.with_relay(relay.clone());

        broadcaster.broadcast_to_channel(1, "a").await.unwrap();
        broadcaster.broadcast_to_user(2, "b").await.unwrap();
        broadcaster.broadcast_to_users(&[3, 4], "c").await.unwrap();
        broadcaster.broadcast_to_users(&[], "d").await.unwrap();

        let published = relay.published.lock().await;
        assert_eq!(
            *published,
            vec![
                RelayTarget::Channel(1),
                RelayTarget::User(2),
                RelayTarget::Users(vec![3, 4]),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_write_surfaces_aggregate_error() {
        let broadcaster = setup().await;
        let (good, mut good_rx) = ChannelTransport::pair();
        let (bad, bad_rx) = ChannelTransport::pair();
        drop(bad_rx);

        let good = Arc::new(Connection::new(1, good));
        let bad = Arc::new(Connection::new(2, bad));
        broadcaster.registry().register(good).await.unwrap();
        broadcaster.registry().register(bad.clone()).await.unwrap();

        let err = broadcaster
            .broadcast_to_users(&[1, 2], "msg")
            .await
            .unwrap_err();
        let BroadcastError::Delivery {
            attempted,
            delivered,
            failed,
            ..
        } = err;
        assert_eq!((attempted, delivered, failed), (2, 1, 1));
        assert_eq!(good_rx.recv().await.unwrap(), Bytes::from_static(b"msg"));
        assert!(!broadcaster.registry().index().is_user_online(2).await);
        assert!(!broadcaster.registry().is_live(bad.id()).await);
    }
}
