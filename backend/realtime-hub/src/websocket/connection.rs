use crate::error::ConnectionError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub type UserId = u64;
pub type ChannelId = u64;

/// Unique identifier for one connection instance.
///
/// A user that reconnects gets a new id, which lets the registry tell a stale
/// connection apart from its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting = 0,
    Registered = 1,
    Active = 2,
    Unregistering = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Registered,
            2 => ConnectionState::Active,
            3 => ConnectionState::Unregistering,
            _ => ConnectionState::Closed,
        }
    }
}

/// Write half of a socket.
///
/// Implementations are not required to tolerate concurrent writers; the
/// owning [`Connection`] serializes every call.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, payload: Bytes) -> Result<(), ConnectionError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// One accepted, authenticated socket.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    transport: Mutex<Box<dyn Transport>>,
    state: AtomicU8,
}

impl Connection {
    pub fn new(user_id: UserId, transport: impl Transport + 'static) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id,
            transport: Mutex::new(Box::new(transport)),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move into `Unregistering` from any earlier state.
    ///
    /// Exactly one caller wins; everyone else gets `false`.
    pub(crate) fn begin_unregister(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Unregistering as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Unregistering as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Serialized write: acquire the write lock, send, release.
    ///
    /// `timeout` bounds lock acquisition and the send together, so a peer
    /// stuck behind back-pressure fails fast instead of holding up the caller.
    pub async fn write(&self, payload: Bytes, timeout: Duration) -> Result<(), ConnectionError> {
        if !self.is_active() {
            return Err(ConnectionError::NotActive);
        }

        let write = async {
            let mut transport = self.transport.lock().await;
            transport.send(payload).await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::WriteTimeout(timeout)),
        }
    }

    /// Close the transport and mark the connection `Closed`.
    ///
    /// Secondary errors (already closed peer, lock held past `timeout`) are
    /// logged and swallowed.
    pub(crate) async fn shutdown(&self, timeout: Duration) {
        let close = async {
            let mut transport = self.transport.lock().await;
            transport.close().await
        };

        match tokio::time::timeout(timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(
                    connection_id = %self.id,
                    user_id = self.user_id,
                    error = %e,
                    "transport close reported an error"
                );
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = %self.id,
                    user_id = self.user_id,
                    "transport close timed out"
                );
            }
        }

        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish()
    }
}

/// In-process transport backed by an unbounded channel.
///
/// Send fails once the receiving half is dropped; `close` drops the sender so
/// the receiver observes end-of-stream.
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, payload: Bytes) -> Result<(), ConnectionError> {
        match &self.tx {
            Some(tx) => tx.send(payload).map_err(|_| ConnectionError::Closed),
            None => Err(ConnectionError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match self.tx.take() {
            Some(_) => Ok(()),
            None => Err(ConnectionError::Closed),
        }
    }
}
