//! Presence relay server

mod bus;
mod config;
mod coordinator;
mod error;
mod gateway;
mod hub;
mod protocol;
mod registry;
mod store;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use config::Config;
use hub::RealtimeHub;
use serde::Deserialize;
use store::RedisStore;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = RedisStore::connect(&config.redis_url, config.presence.store_timeout_ms).await?;
    let hub = RealtimeHub::new(&config, Arc::new(store));
    hub.start();

    // Presence sweep scheduler
    let sweep_hub = hub.clone();
    let sweep_interval = config.presence.sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            sweep_hub.sweep_once().await;
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(gateway::ws_handler))
        .route("/online", get(online_handler))
        .route("/online/:user_id", get(online_status_handler))
        .route("/online/query", post(online_query_handler))
        .route("/emit", post(emit_handler))
        .layer(cors)
        .with_state(hub.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🚀 Presence relay server started");
    tracing::info!("Instance: {}", config.instance_id);
    tracing::info!("WebSocket: ws://{}/ws", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(State(hub): State<Arc<RealtimeHub>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "server": "presence-relay-rs",
        "instance_id": hub.coordinator().instance_id(),
        "local_connections": hub.registry().connection_count(),
        "local_users": hub.registry().user_count(),
        "local_rooms": hub.registry().room_count(),
        "timestamp": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }))
}

/// Everyone online, earliest connect first
async fn online_handler(State(hub): State<Arc<RealtimeHub>>) -> Json<serde_json::Value> {
    let user_ids = hub.coordinator().online_user_ids().await;
    Json(serde_json::json!({ "online": user_ids }))
}

async fn online_status_handler(
    State(hub): State<Arc<RealtimeHub>>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    let coordinator = hub.coordinator();
    let ids = vec![user_id.clone()];
    let last_connect = coordinator.last_connect_at_ms_by_user_id(&ids).await;
    Json(serde_json::json!({
        "user_id": user_id,
        "online": coordinator.is_online(&user_id).await,
        "idle": coordinator.is_idle(&user_id).await,
        "last_connect_at_ms": last_connect.get(&user_id),
        "connections_on_this_instance":
            coordinator.connection_ids_on_this_instance(&user_id).await,
    }))
}

#[derive(Debug, Deserialize)]
struct OnlineQuery {
    user_ids: Vec<String>,
}

/// Bulk status lookup for read APIs (online indicators)
async fn online_query_handler(
    State(hub): State<Arc<RealtimeHub>>,
    Json(query): Json<OnlineQuery>,
) -> Json<serde_json::Value> {
    let coordinator = hub.coordinator();
    Json(serde_json::json!({
        "online": coordinator.online_by_user_ids(&query.user_ids).await,
        "idle": coordinator.idle_by_user_ids(&query.user_ids).await,
        "last_connect_at_ms": coordinator.last_connect_at_ms_by_user_id(&query.user_ids).await,
    }))
}

#[derive(Debug, Deserialize)]
struct EmitRequest {
    user_id: Option<String>,
    room: Option<String>,
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Push endpoint for business collaborators (notifications, messages, ...).
/// Always answers ok: the caller's own mutation has already committed.
async fn emit_handler(
    State(hub): State<Arc<RealtimeHub>>,
    Json(request): Json<EmitRequest>,
) -> Json<serde_json::Value> {
    let sent = if let Some(user_id) = &request.user_id {
        hub.emit_to_user(user_id, &request.event, request.data)
    } else if let Some(room) = &request.room {
        hub.emit_to_room(room, &request.event, request.data)
    } else {
        0
    };
    Json(serde_json::json!({ "status": "ok", "local_sent": sent }))
}
