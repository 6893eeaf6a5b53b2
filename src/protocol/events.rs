//! Message and event definitions

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → server messages over the gateway WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    // Connection
    Heartbeat,

    // Activity signals (driven by the client-side idle timer)
    Idle,
    Active,

    // Room scopes for targeted broadcasts
    JoinRoom { room: String },
    LeaveRoom { room: String },
}

/// Server → client messages over the gateway WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    // Connection
    Connected { connection_id: String },
    HeartbeatAck,

    // Relayed business event; payload is opaque to this subsystem
    Event { event: String, data: Value },
}

/// Cross-instance broadcast carried on the store's pub/sub channel.
///
/// Presence transitions are supplementary to store state and may be lost;
/// emissions are delivered by whichever instances hold local connections
/// for the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BusEvent {
    Online {
        user_id: String,
        instance_id: String,
    },
    Offline {
        user_id: String,
        instance_id: String,
    },
    Idle {
        user_id: String,
        instance_id: String,
    },
    Active {
        user_id: String,
        instance_id: String,
    },
    EmitToUser {
        user_id: String,
        event: String,
        data: Value,
        instance_id: String,
    },
    EmitToRoom {
        room: String,
        event: String,
        data: Value,
        instance_id: String,
    },
}

/// Per-connection record written to the store with a TTL.
///
/// Owned exclusively by the instance that accepted the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub instance_id: String,
    pub connection_id: String,
    pub user_id: String,
    pub client: String,
    pub connected_at_ms: u64,
    pub last_seen_at_ms: u64,
}
