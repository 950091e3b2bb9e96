use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

pub mod broadcast;
pub mod connection;
pub mod membership;
pub mod message_types;
pub mod relay;
pub mod session;

use crate::error::RegistryError;
use crate::metrics;
use connection::{Connection, ConnectionId, ConnectionState, UserId};
use membership::MembershipIndex;

/// Lifecycle notifications emitted by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEvent {
    Registered {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    Unregistered {
        user_id: UserId,
        connection_id: ConnectionId,
    },
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Bound on each write of the global fan-out path.
    pub write_timeout: Duration,
    /// Bound on closing a transport during unregistration.
    pub close_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
        }
    }
}

struct RegistryInner {
    live: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    index: Arc<MembershipIndex>,
    /// Lifecycle subscribers. Unbounded so a slow consumer never loses an event.
    subscribers: Mutex<Vec<mpsc::UnboundedSender<HubEvent>>>,
    settings: RegistrySettings,
}

/// Connection registry (hub)
///
/// Single authority for which connections are attached to this process.
/// Registration feeds the membership index; unregistration is idempotent and
/// may be triggered concurrently by a close frame, a read error, a failed
/// write or the idle reaper.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(index: Arc<MembershipIndex>) -> Self {
        Self::with_settings(index, RegistrySettings::default())
    }

    pub fn with_settings(index: Arc<MembershipIndex>, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                live: RwLock::new(HashMap::new()),
                index,
                subscribers: Mutex::new(Vec::new()),
                settings,
            }),
        }
    }

    pub fn index(&self) -> &Arc<MembershipIndex> {
        &self.inner.index
    }

    /// Receive every lifecycle event emitted from now on, in emission order.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<HubEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    fn emit(&self, event: HubEvent) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(event).is_ok());
    }

    /// Attach a freshly upgraded connection.
    ///
    /// Registering a live instance again is a no-op. An instance that already
    /// began unregistering is rejected.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        if !conn.transition(ConnectionState::Connecting, ConnectionState::Registered) {
            return match conn.state() {
                ConnectionState::Unregistering | ConnectionState::Closed => {
                    Err(RegistryError::ConnectionClosed(conn.id()))
                }
                _ => Ok(()),
            };
        }

        let user_id = conn.user_id();
        let connection_id = conn.id();

        self.inner
            .live
            .write()
            .await
            .insert(connection_id, conn.clone());
        self.inner.index.add_connection(user_id, conn.clone()).await;

        if !conn.transition(ConnectionState::Registered, ConnectionState::Active) {
            // An unregister raced with us and may have run before the index
            // insert above; undo so nothing stale remains.
            self.inner.live.write().await.remove(&connection_id);
            self.inner
                .index
                .remove_connection_instance(user_id, connection_id)
                .await;
            return Err(RegistryError::ConnectionClosed(connection_id));
        }

        metrics::connection_opened();
        tracing::info!(user_id, %connection_id, "connection registered");
        self.emit(HubEvent::Registered {
            user_id,
            connection_id,
        });
        Ok(())
    }

    /// Synchronous half of unregistration: state, live set and index.
    ///
    /// Returns `true` only for the call that moved the connection into
    /// `Unregistering`; that caller is responsible for closing it.
    pub async fn detach(&self, conn: &Connection) -> bool {
        let was_active = conn.is_active();
        if !conn.begin_unregister() {
            return false;
        }

        let connection_id = conn.id();
        let user_id = conn.user_id();

        self.inner.live.write().await.remove(&connection_id);
        let removed = self
            .inner
            .index
            .remove_connection_instance(user_id, connection_id)
            .await;

        if was_active {
            metrics::connection_closed();
        }
        tracing::debug!(user_id, %connection_id, index_removed = removed, "connection detached");
        true
    }

    /// Remove and close a connection. Never fails; repeated calls are no-ops.
    pub async fn unregister(&self, conn: &Connection) {
        if !self.detach(conn).await {
            tracing::debug!(
                user_id = conn.user_id(),
                connection_id = %conn.id(),
                "unregister ignored, already unregistering"
            );
            return;
        }
        self.finish_close(conn).await;
    }

    /// Close a detached connection on a background task.
    pub(crate) fn close_in_background(&self, conn: Arc<Connection>) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.finish_close(&conn).await;
        });
    }

    async fn finish_close(&self, conn: &Connection) {
        conn.shutdown(self.inner.settings.close_timeout).await;

        tracing::info!(
            user_id = conn.user_id(),
            connection_id = %conn.id(),
            "connection unregistered"
        );
        self.emit(HubEvent::Unregistered {
            user_id: conn.user_id(),
            connection_id: conn.id(),
        });
    }

    /// O(n) fan-out over every live connection except those of `exclude`.
    ///
    /// Reserved for low-frequency global events such as status flips; channel
    /// chat goes through [`broadcast::Broadcaster`].
    pub async fn broadcast_except(&self, exclude: UserId, payload: Bytes) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let live = self.inner.live.read().await;
            live.values()
                .filter(|conn| conn.user_id() != exclude)
                .cloned()
                .collect()
        };

        let outcome = broadcast::deliver(
            self,
            targets,
            payload,
            self.inner.settings.write_timeout,
            broadcast::DEFAULT_CONCURRENCY,
            "global",
        )
        .await;
        outcome.delivered
    }

    pub async fn live_count(&self) -> usize {
        self.inner.live.read().await.len()
    }

    pub async fn is_live(&self, connection_id: ConnectionId) -> bool {
        self.inner.live.read().await.contains_key(&connection_id)
    }

    /// Periodically unregister connections idle for longer than `idle_timeout`.
    pub fn spawn_idle_reaper(&self, idle_timeout: Duration, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = registry.reap_idle(idle_timeout).await;
                if reaped > 0 {
                    tracing::info!(reaped, "idle connections unregistered");
                }
            }
        })
    }

    /// Unregister every connection idle for longer than `idle_timeout`.
    pub async fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let idle = match chrono::Duration::from_std(idle_timeout) {
            Ok(idle) => idle,
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - idle;

        let mut reaped = 0;
        for conn in self.inner.index.idle_connections(cutoff).await {
            tracing::debug!(user_id = conn.user_id(), "connection idle, unregistering");
            if self.detach(&conn).await {
                self.finish_close(&conn).await;
                reaped += 1;
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connection::ChannelTransport;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(MembershipIndex::new()))
    }

    fn connection(user_id: UserId) -> (Arc<Connection>, UnboundedReceiver<Bytes>) {
        let (transport, rx) = ChannelTransport::pair();
        (Arc::new(Connection::new(user_id, transport)), rx)
    }

    #[tokio::test]
    async fn test_register_activates_and_indexes() {
        let registry = registry();
        let (conn, _rx) = connection(1);

        registry.register(conn.clone()).await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(registry.index().is_user_online(1).await);
        assert_eq!(registry.live_count().await, 1);
        assert!(registry.index().metadata(1).await.unwrap().channels.is_empty());
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_instance() {
        let registry = registry();
        let (conn, _rx) = connection(1);

        registry.register(conn.clone()).await.unwrap();
        registry.register(conn.clone()).await.unwrap();
        assert_eq!(registry.live_count().await, 1);
    }

    #[tokio::test]
    async fn test_register_rejects_closed_connection() {
        let registry = registry();
        let (conn, _rx) = connection(1);
        registry.register(conn.clone()).await.unwrap();
        registry.unregister(&conn).await;

        let err = registry.register(conn.clone()).await.unwrap_err();
        assert!(matches!(err, RegistryError::ConnectionClosed(id) if id == conn.id()));
    }

    #[tokio::test]
    async fn test_unregister_twice_is_noop() {
        let registry = registry();
        let (conn, mut rx) = connection(1);
        registry.register(conn.clone()).await.unwrap();
        registry.index().add_user_to_channel(1, 10).await;

        registry.unregister(&conn).await;
        registry.unregister(&conn).await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!registry.index().is_user_online(1).await);
        assert!(!registry.index().has_channel_entry(10).await);
        assert_eq!(registry.live_count().await, 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_replacement() {
        let registry = registry();
        let (old, _old_rx) = connection(1);
        let (new, _new_rx) = connection(1);

        registry.register(old.clone()).await.unwrap();
        registry.register(new.clone()).await.unwrap();
        assert_eq!(registry.live_count().await, 2);

        registry.unregister(&old).await;

        let mapped = registry.index().connection(1).await.unwrap();
        assert_eq!(mapped.id(), new.id());
        assert_eq!(registry.live_count().await, 1);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let registry = registry();
        let mut events = registry.subscribe_events();
        let (conn, _rx) = connection(3);

        registry.register(conn.clone()).await.unwrap();
        registry.unregister(&conn).await;

        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::Registered {
                user_id: 3,
                connection_id: conn.id()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::Unregistered {
                user_id: 3,
                connection_id: conn.id()
            }
        );
    }

    #[tokio::test]
    async fn test_connection_burst_emits_every_event() {
        let registry = registry();
        let mut events = registry.subscribe_events();

        let mut held = Vec::new();
        for user_id in 1..=3000 {
            let (conn, rx) = connection(user_id);
            registry.register(conn.clone()).await.unwrap();
            held.push((conn, rx));
        }
        for (conn, _) in held.iter().take(1500) {
            registry.unregister(conn).await;
        }

        let mut registered = 0;
        let mut unregistered = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                HubEvent::Registered { .. } => registered += 1,
                HubEvent::Unregistered { .. } => unregistered += 1,
            }
        }
        assert_eq!((registered, unregistered), (3000, 1500));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let registry = registry();
        drop(registry.subscribe_events());
        let mut live = registry.subscribe_events();
        let (conn, _rx) = connection(1);

        registry.register(conn.clone()).await.unwrap();

        assert!(matches!(live.recv().await, Some(HubEvent::Registered { .. })));
        assert_eq!(registry.inner.subscribers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_actor() {
        let registry = registry();
        let (a, mut a_rx) = connection(1);
        let (b, mut b_rx) = connection(2);
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();

        let delivered = registry
            .broadcast_except(1, Bytes::from_static(b"status"))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"status"));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reap_idle_unregisters() {
        let registry = registry();
        let (conn, _rx) = connection(1);
        registry.register(conn.clone()).await.unwrap();

        assert_eq!(registry.reap_idle(Duration::from_secs(3600)).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.reap_idle(Duration::from_millis(1)).await, 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!registry.index().is_user_online(1).await);
    }
}
