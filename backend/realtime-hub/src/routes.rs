//! HTTP surface for operators and application collaborators.

use crate::error::{ApiError, BroadcastError};
use crate::metrics;
use crate::presence::PresenceTracker;
use crate::websocket::broadcast::Broadcaster;
use crate::{ChannelId, UserId};
use actix_web::{delete, get, post, put, web, HttpResponse};
use bytes::Bytes;
use prometheus::Registry;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct HttpState {
    pub broadcaster: Broadcaster,
    pub presence: PresenceTracker,
    pub instance_id: String,
    pub metrics: Registry,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub instance_id: String,
    pub live_connections: usize,
    pub online_users: usize,
    pub channels: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub delivered: usize,
    pub failed: usize,
}

impl From<Result<usize, BroadcastError>> for DeliveryResponse {
    fn from(result: Result<usize, BroadcastError>) -> Self {
        match result {
            Ok(delivered) => Self {
                delivered,
                failed: 0,
            },
            Err(BroadcastError::Delivery {
                delivered, failed, ..
            }) => Self { delivered, failed },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MembershipResponse {
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserIdsRequest {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserIdsResponse {
    pub user_ids: Vec<UserId>,
}

fn require_payload(body: &Bytes) -> Result<(), ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty payload".into()));
    }
    Ok(())
}

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

#[get("/metrics")]
pub async fn metrics_text(state: web::Data<HttpState>) -> Result<HttpResponse, ApiError> {
    let body = metrics::gather_text(&state.metrics).map_err(|e| {
        tracing::error!(error = %e, "failed to encode metrics");
        ApiError::Internal
    })?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}

#[get("/stats")]
pub async fn stats(state: web::Data<HttpState>) -> HttpResponse {
    let registry = state.broadcaster.registry();
    HttpResponse::Ok().json(StatsResponse {
        instance_id: state.instance_id.clone(),
        live_connections: registry.live_count().await,
        online_users: registry.index().online_count().await,
        channels: registry.index().channel_count().await,
    })
}

/// POST /v1/channels/{id}/broadcast
/// Raw body is delivered as-is; partial failures are reported, not raised.
#[post("/v1/channels/{id}/broadcast")]
pub async fn broadcast_channel(
    state: web::Data<HttpState>,
    channel_id: web::Path<ChannelId>,
    body: Bytes,
) -> Result<HttpResponse, ApiError> {
    require_payload(&body)?;
    let result = state
        .broadcaster
        .broadcast_to_channel(channel_id.into_inner(), body)
        .await;
    Ok(HttpResponse::Ok().json(DeliveryResponse::from(result)))
}

/// POST /v1/users/{id}/broadcast
#[post("/v1/users/{id}/broadcast")]
pub async fn broadcast_user(
    state: web::Data<HttpState>,
    user_id: web::Path<UserId>,
    body: Bytes,
) -> Result<HttpResponse, ApiError> {
    require_payload(&body)?;
    let result = state
        .broadcaster
        .broadcast_to_user(user_id.into_inner(), body)
        .await;
    Ok(HttpResponse::Ok().json(DeliveryResponse::from(result)))
}

/// PUT /v1/channels/{channel_id}/members/{user_id}
/// Only connected users can join; for offline users this is a no-op.
#[put("/v1/channels/{channel_id}/members/{user_id}")]
pub async fn join_channel(
    state: web::Data<HttpState>,
    path: web::Path<(ChannelId, UserId)>,
) -> HttpResponse {
    let (channel_id, user_id) = path.into_inner();
    let changed = state
        .broadcaster
        .registry()
        .index()
        .add_user_to_channel(user_id, channel_id)
        .await;
    HttpResponse::Ok().json(MembershipResponse { changed })
}

#[delete("/v1/channels/{channel_id}/members/{user_id}")]
pub async fn leave_channel(
    state: web::Data<HttpState>,
    path: web::Path<(ChannelId, UserId)>,
) -> HttpResponse {
    let (channel_id, user_id) = path.into_inner();
    let changed = state
        .broadcaster
        .registry()
        .index()
        .remove_user_from_channel(user_id, channel_id)
        .await;
    HttpResponse::Ok().json(MembershipResponse { changed })
}

#[get("/v1/channels/{id}/online")]
pub async fn channel_online(
    state: web::Data<HttpState>,
    channel_id: web::Path<ChannelId>,
) -> HttpResponse {
    let mut user_ids = state
        .broadcaster
        .registry()
        .index()
        .online_users_in_channel(channel_id.into_inner())
        .await;
    user_ids.sort_unstable();
    HttpResponse::Ok().json(UserIdsResponse { user_ids })
}

#[post("/v1/presence/online-friends")]
pub async fn online_friends(
    state: web::Data<HttpState>,
    body: web::Json<UserIdsRequest>,
) -> Result<HttpResponse, ApiError> {
    let user_ids = state.presence.get_online_friends(&body.user_ids).await?;
    Ok(HttpResponse::Ok().json(UserIdsResponse { user_ids }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(metrics_text)
        .service(stats)
        .service(broadcast_channel)
        .service(broadcast_user)
        .service(join_channel)
        .service(leave_channel)
        .service(channel_online)
        .service(online_friends);
}
