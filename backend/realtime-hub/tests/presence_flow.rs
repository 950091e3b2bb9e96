// Presence integration tests
//
// Two hub instances share an in-memory presence store, status bus and relay
// to model a horizontally scaled deployment.

use async_trait::async_trait;
use bytes::Bytes;
use realtime_hub::error::RelayError;
use realtime_hub::presence::{
    MemoryPresenceStore, MemoryStatusBus, PresenceSettings, PresenceStatus, PresenceTracker,
};
use realtime_hub::websocket::broadcast::{BroadcastSettings, Broadcaster};
use realtime_hub::websocket::connection::{ChannelTransport, Connection};
use realtime_hub::websocket::membership::MembershipIndex;
use realtime_hub::websocket::relay::{apply_envelope, Relay, RelayEnvelope, RelayTarget};
use realtime_hub::websocket::ConnectionRegistry;
use realtime_hub::UserId;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct Instance {
    broadcaster: Broadcaster,
    presence: PresenceTracker,
}

fn instance(
    origin: &str,
    store: Arc<MemoryPresenceStore>,
    bus: Arc<MemoryStatusBus>,
) -> Instance {
    let registry = ConnectionRegistry::new(Arc::new(MembershipIndex::new()));
    let presence =
        PresenceTracker::new(store, registry.clone(), origin, PresenceSettings::default())
            .with_bus(bus);
    Instance {
        broadcaster: Broadcaster::new(registry, BroadcastSettings::default()),
        presence,
    }
}

async fn connect(
    registry: &ConnectionRegistry,
    user_id: UserId,
) -> (Arc<Connection>, UnboundedReceiver<Bytes>) {
    let (transport, rx) = ChannelTransport::pair();
    let conn = Arc::new(Connection::new(user_id, transport));
    registry.register(conn.clone()).await.unwrap();
    (conn, rx)
}

async fn wait_for_status(
    tracker: &PresenceTracker,
    user_id: UserId,
    expected: Option<PresenceStatus>,
) {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if tracker.status(user_id).await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("presence status did not settle");
}

async fn next_json(rx: &mut UnboundedReceiver<Bytes>) -> serde_json::Value {
    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no frame received")
        .expect("transport closed");
    serde_json::from_slice(&frame).unwrap()
}

#[tokio::test]
async fn test_lifecycle_drives_presence() {
    let node = instance(
        "node-a",
        Arc::new(MemoryPresenceStore::new()),
        Arc::new(MemoryStatusBus::new()),
    );
    let registry = node.broadcaster.registry().clone();
    let _listener = node.presence.spawn_lifecycle_listener();

    let (conn, _rx) = connect(&registry, 1).await;
    wait_for_status(&node.presence, 1, Some(PresenceStatus::Online)).await;

    registry.unregister(&conn).await;
    wait_for_status(&node.presence, 1, Some(PresenceStatus::Offline)).await;
}

#[tokio::test]
async fn test_quick_reconnect_does_not_flicker_offline() {
    let node = instance(
        "node-a",
        Arc::new(MemoryPresenceStore::new()),
        Arc::new(MemoryStatusBus::new()),
    );
    let registry = node.broadcaster.registry().clone();
    let _listener = node.presence.spawn_lifecycle_listener();

    let (old, _old_rx) = connect(&registry, 1).await;
    let (_new, _new_rx) = connect(&registry, 1).await;
    registry.unregister(&old).await;

    // Events are handled in order, so once the sentinel is offline every
    // earlier event has been applied
    let (sentinel, _sentinel_rx) = connect(&registry, 99).await;
    registry.unregister(&sentinel).await;
    wait_for_status(&node.presence, 99, Some(PresenceStatus::Offline)).await;

    assert_eq!(
        node.presence.status(1).await.unwrap(),
        Some(PresenceStatus::Online)
    );
}

#[tokio::test]
async fn test_connection_burst_marks_everyone() {
    let node = instance(
        "node-a",
        Arc::new(MemoryPresenceStore::new()),
        Arc::new(MemoryStatusBus::new()),
    );
    let registry = node.broadcaster.registry().clone();
    let _listener = node.presence.spawn_lifecycle_listener();

    // More connects than any bounded event buffer would hold while the
    // listener is busy fanning out each status flip
    let users: Vec<UserId> = (1..=1200).collect();
    let mut held = Vec::with_capacity(users.len());
    for &user_id in &users {
        held.push(connect(&registry, user_id).await);
    }
    for (conn, _) in held.iter().take(300) {
        registry.unregister(conn).await;
    }

    // Events are applied in order, so the last disconnect settles last
    wait_for_status(&node.presence, 300, Some(PresenceStatus::Offline)).await;

    let online = node.presence.get_online_friends(&users).await.unwrap();
    assert_eq!(online, users[300..].to_vec());
    for user_id in [1, 150, 300] {
        assert_eq!(
            node.presence.status(user_id).await.unwrap(),
            Some(PresenceStatus::Offline)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_online_within_offline_ttl_wins() {
    let node = instance(
        "node-a",
        Arc::new(MemoryPresenceStore::new()),
        Arc::new(MemoryStatusBus::new()),
    );

    node.presence.set_online(5).await.unwrap();
    node.presence.set_offline(5).await.unwrap();
    assert!(node.presence.get_online_friends(&[5]).await.unwrap().is_empty());

    tokio::time::advance(Duration::from_secs(30)).await;
    node.presence.set_online(5).await.unwrap();
    assert_eq!(node.presence.get_online_friends(&[5]).await.unwrap(), vec![5]);

    // The old offline TTL must not expire the fresh online record
    tokio::time::advance(Duration::from_secs(45)).await;
    assert_eq!(node.presence.get_online_friends(&[5]).await.unwrap(), vec![5]);
}

#[tokio::test]
async fn test_status_crosses_instances() {
    let store = Arc::new(MemoryPresenceStore::new());
    let bus = Arc::new(MemoryStatusBus::new());
    let a = instance("node-a", store.clone(), bus.clone());
    let b = instance("node-b", store, bus);

    let _b_updates = b.presence.subscribe_to_status_updates().await.unwrap();
    let (_watcher, mut watcher_rx) = connect(b.broadcaster.registry(), 2).await;

    a.presence.set_online(1).await.unwrap();

    let event = next_json(&mut watcher_rx).await;
    assert_eq!(event["type"], "presence.status");
    assert_eq!(event["user_id"], 1);
    assert_eq!(event["status"], "online");

    let online = b.presence.get_online_friends(&[1, 2]).await.unwrap();
    assert_eq!(online, vec![1]);
}

/// Relay that hands envelopes straight to a peer instance.
struct DirectRelay {
    origin: String,
    peer: OnceLock<Broadcaster>,
}

#[async_trait]
impl Relay for DirectRelay {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn publish(&self, target: RelayTarget, payload: Bytes) -> Result<(), RelayError> {
        let envelope = RelayEnvelope::new(&self.origin, target, &payload);
        if let Some(peer) = self.peer.get() {
            apply_envelope(peer, "node-b", envelope).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_channel_broadcast_reaches_other_instance() {
    let store = Arc::new(MemoryPresenceStore::new());
    let bus = Arc::new(MemoryStatusBus::new());
    let a = instance("node-a", store.clone(), bus.clone());
    let b = instance("node-b", store, bus);

    let relay = Arc::new(DirectRelay {
        origin: "node-a".to_string(),
        peer: OnceLock::new(),
    });
    assert!(relay.peer.set(b.broadcaster.clone()).is_ok());
    let a_broadcaster = a.broadcaster.clone().with_relay(relay);

    let (_local, mut local_rx) = connect(a.broadcaster.registry(), 1).await;
    let (_remote, mut remote_rx) = connect(b.broadcaster.registry(), 2).await;
    a.broadcaster.registry().index().add_user_to_channel(1, 100).await;
    b.broadcaster.registry().index().add_user_to_channel(2, 100).await;

    let delivered = a_broadcaster.broadcast_to_channel(100, "hi").await.unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(local_rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
    assert_eq!(remote_rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
}
