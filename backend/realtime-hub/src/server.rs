//! WebSocket accept loop.
//!
//! Each accepted socket is upgraded, authenticated from its bearer token,
//! registered with the hub and handed to its own session task.

use crate::auth::Authenticator;
use crate::presence::PresenceTracker;
use crate::websocket::connection::Connection;
use crate::websocket::session::{run_session, SessionContext, WsTransport};
use crate::websocket::ConnectionRegistry;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub struct ServerContext {
    pub registry: ConnectionRegistry,
    pub presence: Option<PresenceTracker>,
    pub authenticator: Arc<dyn Authenticator>,
    pub write_timeout: Duration,
}

impl ServerContext {
    fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: self.registry.clone(),
            presence: self.presence.clone(),
            write_timeout: self.write_timeout,
        }
    }
}

/// Bearer token from the `token` query parameter or the `Authorization`
/// header, in that order. The query value is percent-decoded.
pub fn extract_token(req: &Request) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key != "token" {
                return None;
            }
            urlencoding::decode(value)
                .ok()
                .map(|decoded| decoded.into_owned())
                .filter(|token| !token.is_empty())
        })
    });
    if from_query.is_some() {
        return from_query;
    }

    req.headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

pub async fn run(listener: TcpListener, ctx: Arc<ServerContext>) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "websocket listener started"),
        Err(e) => warn!(error = %e, "websocket listener has no local address"),
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_socket(stream, addr, ctx).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "failed to accept tcp connection");
            }
        }
    }
}

async fn handle_socket(stream: TcpStream, addr: SocketAddr, ctx: Arc<ServerContext>) {
    let captured: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let slot = captured.clone();

    let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Ok(mut slot) = slot.lock() {
            *slot = extract_token(req);
        }
        Ok(response)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let token = captured.lock().ok().and_then(|mut slot| slot.take());
    let (mut sink, stream) = ws_stream.split();

    let user_id = match ctx.authenticator.authenticate(token.as_deref().unwrap_or("")).await {
        Ok(user_id) => user_id,
        Err(e) => {
            info!(%addr, error = %e, "websocket authentication failed");
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: "unauthorized".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            let _ = sink.close().await;
            return;
        }
    };

    let conn = Arc::new(Connection::new(user_id, WsTransport::new(sink)));
    if let Err(e) = ctx.registry.register(conn.clone()).await {
        warn!(user_id, error = %e, "failed to register connection");
        return;
    }

    debug!(user_id, %addr, connection_id = %conn.id(), "session started");
    run_session(ctx.session_context(), conn, stream).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("Authorization", auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_token_from_query() {
        let req = request("/ws?foo=1&token=abc.def", None);
        assert_eq!(extract_token(&req).as_deref(), Some("abc.def"));
    }

    #[test]
    fn test_token_from_header() {
        let req = request("/ws", Some("Bearer xyz"));
        assert_eq!(extract_token(&req).as_deref(), Some("xyz"));
    }

    #[test]
    fn test_query_wins_over_header() {
        let req = request("/ws?token=q", Some("Bearer h"));
        assert_eq!(extract_token(&req).as_deref(), Some("q"));
    }

    #[test]
    fn test_query_token_is_percent_decoded() {
        let req = request("/ws?room=1&token=abc%2Edef%3D%3D", None);
        assert_eq!(extract_token(&req).as_deref(), Some("abc.def=="));
        assert_eq!(extract_token(&request("/ws?token=%FF", None)), None);
    }

    #[test]
    fn test_missing_token() {
        assert_eq!(extract_token(&request("/ws?token=", None)), None);
        assert_eq!(extract_token(&request("/ws", Some("Basic abc"))), None);
    }
}
