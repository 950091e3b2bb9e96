//! Per-connection session: the write adapter over a tungstenite sink and the
//! read loop that turns client frames into index mutations.

use super::connection::{Connection, Transport, UserId};
use super::message_types::{ServerEvent, WsInboundEvent};
use super::ConnectionRegistry;
use crate::error::ConnectionError;
use crate::presence::PresenceTracker;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

/// [`Transport`] over the write half of a WebSocket.
///
/// UTF-8 payloads go out as text frames, anything else as binary.
pub struct WsTransport<K> {
    sink: K,
}

impl<K> WsTransport<K> {
    pub fn new(sink: K) -> Self {
        Self { sink }
    }
}

fn map_ws_error(e: WsError) -> ConnectionError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ConnectionError::Closed,
        other => ConnectionError::Transport(other.to_string()),
    }
}

#[async_trait]
impl<K> Transport for WsTransport<K>
where
    K: Sink<Message, Error = WsError> + Unpin + Send,
{
    async fn send(&mut self, payload: Bytes) -> Result<(), ConnectionError> {
        let message = match String::from_utf8(payload.to_vec()) {
            Ok(text) => Message::text(text),
            Err(e) => Message::binary(e.into_bytes()),
        };
        self.sink.send(message).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.sink.close().await.map_err(map_ws_error)
    }
}

#[derive(Clone)]
pub struct SessionContext {
    pub registry: ConnectionRegistry,
    pub presence: Option<PresenceTracker>,
    pub write_timeout: Duration,
}

/// Apply one client control frame. Returns the reply to send, if any.
pub async fn handle_inbound(
    ctx: &SessionContext,
    conn: &Connection,
    text: &str,
) -> Option<ServerEvent> {
    let user_id = conn.user_id();
    let index = ctx.registry.index();
    index.update_last_activity(user_id).await;

    let event = match serde_json::from_str::<WsInboundEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(user_id, error = %e, "unparseable client frame");
            return Some(ServerEvent::Error {
                message: format!("invalid frame: {e}"),
            });
        }
    };

    match event {
        WsInboundEvent::Subscribe { channel_id } => {
            if index.add_user_to_channel(user_id, channel_id).await {
                Some(ServerEvent::Subscribed { channel_id })
            } else {
                Some(ServerEvent::Error {
                    message: "connection is not registered".to_string(),
                })
            }
        }
        WsInboundEvent::Unsubscribe { channel_id } => {
            index.remove_user_from_channel(user_id, channel_id).await;
            Some(ServerEvent::Unsubscribed { channel_id })
        }
        WsInboundEvent::Heartbeat => {
            refresh_presence(ctx, user_id).await;
            Some(ServerEvent::HeartbeatAck)
        }
    }
}

/// Protocol pings count as heartbeats too, so keep-alive clients stay online.
async fn refresh_presence(ctx: &SessionContext, user_id: UserId) {
    match &ctx.presence {
        Some(presence) => {
            if let Err(e) = presence.heartbeat(user_id).await {
                warn!(user_id, error = %e, "presence heartbeat failed");
            }
        }
        None => ctx.registry.index().update_last_activity(user_id).await,
    }
}

/// Drive one connection until the peer leaves, then unregister it.
///
/// Replies go through [`Connection::write`] so they share the write lock with
/// broadcasts.
pub async fn run_session<R>(ctx: SessionContext, conn: Arc<Connection>, mut inbound: R)
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let user_id = conn.user_id();

    while let Some(frame) = inbound.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                debug!(user_id, error = %e, "read error, closing session");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let Some(reply) = handle_inbound(&ctx, &conn, text.as_str()).await else {
                    continue;
                };
                let payload = match reply.to_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(user_id, error = %e, "failed to encode reply");
                        continue;
                    }
                };
                if let Err(e) = conn.write(payload, ctx.write_timeout).await {
                    debug!(user_id, error = %e, "reply failed, closing session");
                    break;
                }
            }
            Message::Ping(_) | Message::Pong(_) => refresh_presence(&ctx, user_id).await,
            Message::Binary(_) => {
                ctx.registry.index().update_last_activity(user_id).await;
            }
            Message::Close(frame) => {
                debug!(user_id, ?frame, "close frame received");
                break;
            }
            Message::Frame(_) => {}
        }
    }

    ctx.registry.unregister(&conn).await;
}
