use crate::error::AppError;
use crate::presence::PresenceSettings;
use crate::websocket::broadcast::{BroadcastSettings, DEFAULT_CONCURRENCY};
use crate::websocket::RegistrySettings;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceBackend {
    Redis,
    Memory,
}

impl FromStr for PresenceBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(PresenceBackend::Redis),
            "memory" => Ok(PresenceBackend::Memory),
            other => Err(AppError::Config(format!(
                "PRESENCE_BACKEND must be redis or memory, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_port: u16,
    pub http_port: u16,
    pub redis_url: String,
    pub presence_backend: PresenceBackend,
    pub presence_online_ttl_secs: u64,
    pub presence_offline_ttl_secs: u64,
    pub write_timeout_ms: u64,
    /// Zero disables the idle reaper.
    pub idle_timeout_secs: u64,
    pub broadcast_concurrency: usize,
    pub instance_id: String,
    pub jwt_secret: String,
    pub cross_instance_relay: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::Config("JWT_SECRET missing".into()))?;

        let presence_backend = match lookup("PRESENCE_BACKEND") {
            Some(value) => value.parse()?,
            None => PresenceBackend::Redis,
        };

        let cross_instance_relay = lookup("CROSS_INSTANCE_RELAY")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        Ok(Self {
            ws_port: parse_or(&lookup, "WS_PORT", 8080),
            http_port: parse_or(&lookup, "PORT", 3000),
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            presence_backend,
            presence_online_ttl_secs: parse_or(&lookup, "PRESENCE_ONLINE_TTL_SECS", 300),
            presence_offline_ttl_secs: parse_or(&lookup, "PRESENCE_OFFLINE_TTL_SECS", 60),
            write_timeout_ms: parse_or(&lookup, "WS_WRITE_TIMEOUT_MS", 5000),
            idle_timeout_secs: parse_or(&lookup, "WS_IDLE_TIMEOUT_SECS", 120),
            broadcast_concurrency: parse_or(&lookup, "BROADCAST_CONCURRENCY", DEFAULT_CONCURRENCY),
            instance_id: lookup("INSTANCE_ID")
                .unwrap_or_else(|| format!("hub-{}", uuid::Uuid::new_v4().simple())),
            jwt_secret,
            cross_instance_relay,
        })
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            write_timeout: self.write_timeout(),
            ..RegistrySettings::default()
        }
    }

    pub fn broadcast_settings(&self) -> BroadcastSettings {
        BroadcastSettings {
            write_timeout: self.write_timeout(),
            concurrency: self.broadcast_concurrency.max(1),
        }
    }

    pub fn presence_settings(&self) -> PresenceSettings {
        PresenceSettings {
            online_ttl: Duration::from_secs(self.presence_online_ttl_secs),
            offline_ttl: Duration::from_secs(self.presence_offline_ttl_secs),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
