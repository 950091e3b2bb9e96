use crate::websocket::connection::ConnectionId;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use std::time::Duration;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Startup and wiring failures for the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Failure of a single connection's transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is not active")]
    NotActive,

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} is already closed")]
    ConnectionClosed(ConnectionId),
}

/// Aggregate delivery failure for one broadcast call.
///
/// `last` is the most recent write error; it does not enumerate every failed
/// recipient.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("{failed} of {attempted} deliveries failed: {last}")]
    Delivery {
        attempted: usize,
        delivered: usize,
        failed: usize,
        #[source]
        last: ConnectionError,
    },
}

pub type PresenceResult<T> = Result<T, PresenceError>;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid presence value: {0}")]
    InvalidValue(String),

    #[error("presence backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payload decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Failures surfaced by the HTTP routes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal server error")]
    Internal,
}

impl From<PresenceError> for ApiError {
    fn from(e: PresenceError) -> Self {
        ApiError::ServiceUnavailable(e.to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_string(),
        }))
    }
}
