//! Channel membership index
//!
//! Bidirectional user <-> channel lookup plus per-user connection metadata.
//! All three maps live behind one reader/writer lock: mutations take the
//! write guard, lookups share the read guard, so fan-out lookups run in
//! parallel with each other but never observe a half-applied mutation.

use super::connection::{ChannelId, Connection, ConnectionId, UserId};
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Auxiliary record kept for every online user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub channels: HashSet<ChannelId>,
}

impl ConnectionMetadata {
    fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            connected_at: now,
            last_activity: now,
            channels: HashSet::new(),
        }
    }
}

/// A broken index invariant. Unreachable under the locking discipline; only
/// reported by [`MembershipIndex::verify_invariants`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("channel {channel} lists user {user} who has no metadata")]
    MemberWithoutMetadata { user: UserId, channel: ChannelId },

    #[error("user {user} metadata lists channel {channel} but is not a member")]
    MissingMembership { user: UserId, channel: ChannelId },

    #[error("channel {0} has an empty member set")]
    EmptyChannel(ChannelId),

    #[error("user {0} has metadata but no connection")]
    MetadataWithoutConnection(UserId),

    #[error("user {0} has a connection but no metadata")]
    ConnectionWithoutMetadata(UserId),
}

#[derive(Default)]
struct IndexInner {
    connections: HashMap<UserId, Arc<Connection>>,
    channels: HashMap<ChannelId, HashSet<UserId>>,
    metadata: HashMap<UserId, ConnectionMetadata>,
}

impl IndexInner {
    fn remove_member(&mut self, channel_id: ChannelId, user_id: UserId) -> bool {
        match self.channels.entry(channel_id) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(&user_id);
                if entry.get().is_empty() {
                    entry.remove();
                    tracing::debug!(channel_id, "pruned empty channel");
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    fn detach_user(&mut self, user_id: UserId) -> Option<Arc<Connection>> {
        let connection = self.connections.remove(&user_id);
        if let Some(meta) = self.metadata.remove(&user_id) {
            for channel_id in meta.channels {
                self.remove_member(channel_id, user_id);
            }
        }
        connection
    }

    fn is_online(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }
}

#[derive(Default)]
pub struct MembershipIndex {
    inner: RwLock<IndexInner>,
}

impl MembershipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `user_id` to `connection`.
    ///
    /// Overwrites any previous connection for the user. Existing channel
    /// memberships are retained under the new entry; callers that need a
    /// clean slate must call [`remove_connection`](Self::remove_connection)
    /// first.
    pub async fn add_connection(&self, user_id: UserId, connection: Arc<Connection>) {
        let mut guard = self.inner.write().await;

        let replaced = guard.connections.insert(user_id, connection).is_some();
        match guard.metadata.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let now = Utc::now();
                let meta = entry.get_mut();
                meta.connected_at = now;
                meta.last_activity = now;
            }
            Entry::Vacant(entry) => {
                entry.insert(ConnectionMetadata::new(user_id));
            }
        }

        tracing::debug!(
            user_id,
            replaced,
            online = guard.connections.len(),
            "connection added to index"
        );
    }

    /// Remove the user entirely: every channel membership, the metadata and
    /// the connection entry. No-op when the user is absent.
    pub async fn remove_connection(&self, user_id: UserId) -> Option<Arc<Connection>> {
        let mut guard = self.inner.write().await;
        let removed = guard.detach_user(user_id);
        if removed.is_some() {
            tracing::debug!(
                user_id,
                online = guard.connections.len(),
                "connection removed from index"
            );
        }
        removed
    }

    /// Remove the user only if it is still mapped to `connection_id`.
    ///
    /// A stale connection that lost a last-writer-wins race must not evict the
    /// entry of its replacement.
    pub async fn remove_connection_instance(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> bool {
        let mut guard = self.inner.write().await;
        let current = guard.connections.get(&user_id).map(|c| c.id());
        if current != Some(connection_id) {
            return false;
        }
        guard.detach_user(user_id);
        tracing::debug!(user_id, %connection_id, "connection instance removed from index");
        true
    }

    /// Subscribe a connected user to a channel.
    ///
    /// Returns `false` without touching the index when the user is not
    /// connected here, since membership is tracked only for online users.
    pub async fn add_user_to_channel(&self, user_id: UserId, channel_id: ChannelId) -> bool {
        let mut guard = self.inner.write().await;
        if !guard.is_online(user_id) {
            tracing::debug!(user_id, channel_id, "ignoring channel join for offline user");
            return false;
        }

        let inner = &mut *guard;
        match inner.metadata.get_mut(&user_id) {
            Some(meta) => {
                meta.channels.insert(channel_id);
            }
            None => return false,
        }
        inner.channels.entry(channel_id).or_default().insert(user_id);

        tracing::debug!(
            user_id,
            channel_id,
            members = inner.channels.get(&channel_id).map(|s| s.len()).unwrap_or(0),
            "user joined channel"
        );
        true
    }

    /// Unsubscribe a user. Deletes the channel entry when its last member
    /// leaves. Returns whether the user was a member.
    pub async fn remove_user_from_channel(&self, user_id: UserId, channel_id: ChannelId) -> bool {
        let mut guard = self.inner.write().await;
        if let Some(meta) = guard.metadata.get_mut(&user_id) {
            meta.channels.remove(&channel_id);
        }
        let removed = guard.remove_member(channel_id, user_id);
        if removed {
            tracing::debug!(user_id, channel_id, "user left channel");
        }
        removed
    }

    /// Members of `channel_id` that are currently connected.
    ///
    /// The connection map is checked at read time so a membership record that
    /// outlived its connection never surfaces.
    pub async fn online_users_in_channel(&self, channel_id: ChannelId) -> Vec<UserId> {
        let guard = self.inner.read().await;
        match guard.channels.get(&channel_id) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|user_id| guard.is_online(*user_id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Live connection handles for every online member of `channel_id`.
    pub async fn connections_in_channel(&self, channel_id: ChannelId) -> Vec<Arc<Connection>> {
        let guard = self.inner.read().await;
        match guard.channels.get(&channel_id) {
            Some(members) => members
                .iter()
                .filter_map(|user_id| guard.connections.get(user_id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Live connection handles for the given users; offline ids are skipped
    /// and duplicates collapse.
    pub async fn connections_for(&self, user_ids: &[UserId]) -> Vec<Arc<Connection>> {
        let guard = self.inner.read().await;
        let mut seen = HashSet::with_capacity(user_ids.len());
        user_ids
            .iter()
            .filter(|user_id| seen.insert(**user_id))
            .filter_map(|user_id| guard.connections.get(user_id).cloned())
            .collect()
    }

    pub async fn connection(&self, user_id: UserId) -> Option<Arc<Connection>> {
        let guard = self.inner.read().await;
        guard.connections.get(&user_id).cloned()
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let guard = self.inner.read().await;
        guard.connections.keys().copied().collect()
    }

    pub async fn is_user_online(&self, user_id: UserId) -> bool {
        let guard = self.inner.read().await;
        guard.is_online(user_id)
    }

    /// Refresh the activity timestamp. Unknown users are ignored.
    pub async fn update_last_activity(&self, user_id: UserId) {
        let mut guard = self.inner.write().await;
        if let Some(meta) = guard.metadata.get_mut(&user_id) {
            meta.last_activity = Utc::now();
        }
    }

    pub async fn metadata(&self, user_id: UserId) -> Option<ConnectionMetadata> {
        let guard = self.inner.read().await;
        guard.metadata.get(&user_id).cloned()
    }

    pub async fn channels_of(&self, user_id: UserId) -> Vec<ChannelId> {
        let guard = self.inner.read().await;
        guard
            .metadata
            .get(&user_id)
            .map(|meta| meta.channels.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Connections whose last activity is older than `cutoff`.
    pub async fn idle_connections(&self, cutoff: DateTime<Utc>) -> Vec<Arc<Connection>> {
        let guard = self.inner.read().await;
        guard
            .metadata
            .values()
            .filter(|meta| meta.last_activity < cutoff)
            .filter_map(|meta| guard.connections.get(&meta.user_id).cloned())
            .collect()
    }

    /// Whether a member-set entry exists for the channel (not just whether it
    /// has online members).
    pub async fn has_channel_entry(&self, channel_id: ChannelId) -> bool {
        let guard = self.inner.read().await;
        guard.channels.contains_key(&channel_id)
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.read().await.channels.len()
    }

    pub async fn online_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Check every structural invariant and report the first violation.
    pub async fn verify_invariants(&self) -> Result<(), InvariantViolation> {
        let guard = self.inner.read().await;

        for (channel_id, members) in &guard.channels {
            if members.is_empty() {
                return Err(InvariantViolation::EmptyChannel(*channel_id));
            }
            for user_id in members {
                match guard.metadata.get(user_id) {
                    Some(meta) if meta.channels.contains(channel_id) => {}
                    Some(_) => {
                        return Err(InvariantViolation::MissingMembership {
                            user: *user_id,
                            channel: *channel_id,
                        })
                    }
                    None => {
                        return Err(InvariantViolation::MemberWithoutMetadata {
                            user: *user_id,
                            channel: *channel_id,
                        })
                    }
                }
            }
        }

        for (user_id, meta) in &guard.metadata {
            if !guard.connections.contains_key(user_id) {
                return Err(InvariantViolation::MetadataWithoutConnection(*user_id));
            }
            for channel_id in &meta.channels {
                let is_member = guard
                    .channels
                    .get(channel_id)
                    .map(|members| members.contains(user_id))
                    .unwrap_or(false);
                if !is_member {
                    return Err(InvariantViolation::MissingMembership {
                        user: *user_id,
                        channel: *channel_id,
                    });
                }
            }
        }

        for user_id in guard.connections.keys() {
            if !guard.metadata.contains_key(user_id) {
                return Err(InvariantViolation::ConnectionWithoutMetadata(*user_id));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ChannelTransport;

    fn connection(user_id: UserId) -> Arc<Connection> {
        let (transport, _rx) = ChannelTransport::pair();
        Arc::new(Connection::new(user_id, transport))
    }

    #[tokio::test]
    async fn test_add_connection_creates_metadata() {
        let index = MembershipIndex::new();
        index.add_connection(1, connection(1)).await;

        let meta = index.metadata(1).await.unwrap();
        assert_eq!(meta.user_id, 1);
        assert!(meta.channels.is_empty());
        assert!(index.is_user_online(1).await);
        index.verify_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_readd_retains_channels() {
        let index = MembershipIndex::new();
        index.add_connection(1, connection(1)).await;
        assert!(index.add_user_to_channel(1, 10).await);

        let replacement = connection(1);
        index.add_connection(1, replacement.clone()).await;

        assert_eq!(index.channels_of(1).await, vec![10]);
        assert_eq!(index.connection(1).await.unwrap().id(), replacement.id());
        index.verify_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_requires_connection() {
        let index = MembershipIndex::new();
        assert!(!index.add_user_to_channel(5, 10).await);
        assert!(!index.has_channel_entry(10).await);
    }

    #[tokio::test]
    async fn test_last_leave_prunes_channel() {
        let index = MembershipIndex::new();
        index.add_connection(1, connection(1)).await;
        index.add_connection(2, connection(2)).await;
        index.add_user_to_channel(1, 10).await;
        index.add_user_to_channel(2, 10).await;

        assert!(index.remove_user_from_channel(1, 10).await);
        assert!(index.has_channel_entry(10).await);
        assert!(index.remove_user_from_channel(2, 10).await);
        assert!(!index.has_channel_entry(10).await);
        assert_eq!(index.channel_count().await, 0);
        index.verify_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_connection_cascades() {
        let index = MembershipIndex::new();
        index.add_connection(1, connection(1)).await;
        index.add_user_to_channel(1, 10).await;
        index.add_user_to_channel(1, 20).await;

        assert!(index.remove_connection(1).await.is_some());
        assert!(!index.has_channel_entry(10).await);
        assert!(!index.has_channel_entry(20).await);
        assert!(index.metadata(1).await.is_none());
        assert!(index.remove_connection(1).await.is_none());
        index.verify_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_instance_ignores_stale_id() {
        let index = MembershipIndex::new();
        let stale = connection(1);
        let fresh = connection(1);
        index.add_connection(1, stale.clone()).await;
        index.add_connection(1, fresh.clone()).await;

        assert!(!index.remove_connection_instance(1, stale.id()).await);
        assert!(index.is_user_online(1).await);
        assert!(index.remove_connection_instance(1, fresh.id()).await);
        assert!(!index.is_user_online(1).await);
    }

    #[tokio::test]
    async fn test_update_last_activity_unknown_user_is_noop() {
        let index = MembershipIndex::new();
        index.update_last_activity(42).await;
        assert!(index.metadata(42).await.is_none());
    }

    #[tokio::test]
    async fn test_idle_connections() {
        let index = MembershipIndex::new();
        index.add_connection(1, connection(1)).await;

        let past = Utc::now() - chrono::Duration::seconds(60);
        assert!(index.idle_connections(past).await.is_empty());

        let future = Utc::now() + chrono::Duration::seconds(60);
        let idle = index.idle_connections(future).await;
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].user_id(), 1);
    }

    #[tokio::test]
    async fn test_connections_for_dedupes_and_skips_offline() {
        let index = MembershipIndex::new();
        index.add_connection(1, connection(1)).await;
        index.add_connection(2, connection(2)).await;

        let conns = index.connections_for(&[1, 1, 2, 99]).await;
        assert_eq!(conns.len(), 2);
    }

    #[tokio::test]
    async fn test_channel_reads_filter_members_without_connection() {
        let index = MembershipIndex::new();
        index.add_connection(1, connection(1)).await;
        index.add_user_to_channel(1, 10).await;

        // Membership record for a user whose connection is gone
        index
            .inner
            .write()
            .await
            .channels
            .entry(10)
            .or_default()
            .insert(2);

        assert_eq!(index.online_users_in_channel(10).await, vec![1]);
        let conns = index.connections_in_channel(10).await;
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].user_id(), 1);
        assert_eq!(
            index.verify_invariants().await,
            Err(InvariantViolation::MemberWithoutMetadata {
                user: 2,
                channel: 10
            })
        );
    }
}
