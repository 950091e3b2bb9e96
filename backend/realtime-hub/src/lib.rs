pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod presence;
pub mod redis_client;
pub mod routes;
pub mod server;
pub mod websocket;

pub use websocket::connection::{ChannelId, UserId};
