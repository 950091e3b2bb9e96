use actix_web::{web, App, HttpServer};
use realtime_hub::{
    auth::JwtAuthenticator,
    config::{Config, PresenceBackend},
    error::AppError,
    logging, metrics,
    presence::{
        MemoryPresenceStore, MemoryStatusBus, PresenceStore, PresenceTracker, RedisPresenceStore,
        RedisStatusBus, StatusBus,
    },
    redis_client::RedisClient,
    routes::{self, HttpState},
    server::{self, ServerContext},
    websocket::{
        broadcast::Broadcaster, membership::MembershipIndex, relay::RedisRelay,
        ConnectionRegistry,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Config::from_env()?;

    let metrics_registry = prometheus::Registry::new();
    metrics::register(&metrics_registry)
        .map_err(|e| AppError::StartServer(format!("metrics: {e}")))?;

    let index = Arc::new(MembershipIndex::new());
    let registry = ConnectionRegistry::with_settings(index, cfg.registry_settings());
    let mut broadcaster = Broadcaster::new(registry.clone(), cfg.broadcast_settings());

    let (store, bus): (Arc<dyn PresenceStore>, Arc<dyn StatusBus>) = match cfg.presence_backend {
        PresenceBackend::Redis => {
            let redis = RedisClient::from_url(&cfg.redis_url).await?;
            tracing::info!(redis_url = %cfg.redis_url, "connected to redis");

            if cfg.cross_instance_relay {
                let relay =
                    RedisRelay::new(redis.client(), redis.manager(), cfg.instance_id.clone());
                let _relay_listener = relay
                    .spawn_listener(broadcaster.clone())
                    .await
                    .map_err(|e| AppError::StartServer(format!("relay: {e}")))?;
                broadcaster = broadcaster.with_relay(Arc::new(relay));
            }

            (
                Arc::new(RedisPresenceStore::new(redis.manager())),
                Arc::new(RedisStatusBus::new(redis.client(), redis.manager())),
            )
        }
        PresenceBackend::Memory => {
            tracing::info!("using in-memory presence, cross-instance relay disabled");
            (
                Arc::new(MemoryPresenceStore::new()),
                Arc::new(MemoryStatusBus::new()),
            )
        }
    };

    let presence = PresenceTracker::new(
        store,
        registry.clone(),
        cfg.instance_id.clone(),
        cfg.presence_settings(),
    )
    .with_bus(bus);

    let _lifecycle_listener = presence.spawn_lifecycle_listener();
    let _status_listener = presence
        .subscribe_to_status_updates()
        .await
        .map_err(|e| AppError::StartServer(format!("status updates: {e}")))?;

    if let Some(idle_timeout) = cfg.idle_timeout() {
        let interval = (idle_timeout / 4).max(Duration::from_secs(1));
        let _reaper = registry.spawn_idle_reaper(idle_timeout, interval);
    }

    let ws_addr = format!("0.0.0.0:{}", cfg.ws_port);
    let listener = TcpListener::bind(&ws_addr)
        .await
        .map_err(|e| AppError::StartServer(format!("bind websocket {ws_addr}: {e}")))?;
    let server_ctx = Arc::new(ServerContext {
        registry: registry.clone(),
        presence: Some(presence.clone()),
        authenticator: Arc::new(JwtAuthenticator::new(&cfg.jwt_secret)),
        write_timeout: cfg.write_timeout(),
    });
    let ws_server = tokio::spawn(server::run(listener, server_ctx));

    let http_state = HttpState {
        broadcaster,
        presence,
        instance_id: cfg.instance_id.clone(),
        metrics: metrics_registry,
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.http_port);
    tracing::info!(
        %bind_addr,
        ws_port = cfg.ws_port,
        instance_id = %cfg.instance_id,
        "starting realtime-hub"
    );

    // actix-web server futures are not Send, so this one runs in the foreground
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind http: {e}")))?
    .run();

    tokio::select! {
        res = http_server => {
            res.map_err(|e| AppError::StartServer(format!("http server: {e}")))?;
        }
        res = ws_server => {
            res.map_err(|e| AppError::StartServer(format!("websocket task join: {e}")))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
