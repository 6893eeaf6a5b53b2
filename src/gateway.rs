//! WebSocket gateway
//!
//! Thin connection-lifecycle collaborator in front of the hub. The user id
//! arrives already authenticated in the upgrade query; this layer only owns
//! the socket loop, and a failing presence write must never fail the socket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

use crate::hub::RealtimeHub;
use crate::protocol::{ClientMessage, ServerMessage};

/// Upgrade query, filled in by the upstream auth layer
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub user_id: String,
    #[serde(default)]
    pub client: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(hub): State<Arc<RealtimeHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub, params))
}

async fn handle_socket(socket: WebSocket, hub: Arc<RealtimeHub>, params: ConnectParams) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let connection_id = Uuid::new_v4().to_string();
    let user_id = params.user_id;
    let client = params.client.unwrap_or_else(|| "unknown".to_string());

    hub.handle_connect(&connection_id, &user_id, &client, tx.clone())
        .await;
    let _ = tx.send(ServerMessage::Connected {
        connection_id: connection_id.clone(),
    });
    tracing::info!(connection_id = %connection_id, user_id = %user_id, "Connection established");

    // Outbound pump
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Ok(msg) = serde_json::from_str::<ClientMessage>(&text) {
                    handle_client_message(&hub, &connection_id, &user_id, &client, &tx, msg).await;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    hub.handle_disconnect(&connection_id, &user_id).await;
    send_task.abort();
    tracing::info!(connection_id = %connection_id, user_id = %user_id, "Connection closed");
}

async fn handle_client_message(
    hub: &Arc<RealtimeHub>,
    connection_id: &str,
    user_id: &str,
    client: &str,
    sender: &UnboundedSender<ServerMessage>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Heartbeat => {
            hub.handle_heartbeat(connection_id, user_id, client).await;
            let _ = sender.send(ServerMessage::HeartbeatAck);
        }
        ClientMessage::Idle => {
            hub.set_idle(user_id).await;
        }
        ClientMessage::Active => {
            hub.set_active(user_id).await;
        }
        ClientMessage::JoinRoom { room } => {
            hub.join_room(connection_id, &room);
            tracing::debug!(connection_id = %connection_id, room = %room, "Joined room");
        }
        ClientMessage::LeaveRoom { room } => {
            hub.leave_room(connection_id, &room);
            tracing::debug!(connection_id = %connection_id, room = %room, "Left room");
        }
    }
}
