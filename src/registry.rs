//! Per-instance connection registry
//!
//! Purely local, never shared: maps each locally-held connection to its user
//! and back, plus the room scopes the connection joined. Exists so this
//! instance only pays delivery cost for its own connections; remote
//! connections are reached through the bus.

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::ServerMessage;

/// A locally-held connection and its outbound channel
pub struct LocalConnection {
    pub user_id: String,
    #[allow(dead_code)]
    pub client: String,
    pub sender: UnboundedSender<ServerMessage>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    /// connection_id -> connection
    connections: DashMap<String, LocalConnection>,
    /// user_id -> local connection ids
    by_user: DashMap<String, DashSet<String>>,
    /// room -> local connection ids
    rooms: DashMap<String, DashSet<String>>,
    /// connection_id -> rooms joined, for disconnect cleanup
    rooms_by_conn: DashMap<String, DashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        connection_id: &str,
        user_id: &str,
        client: &str,
        sender: UnboundedSender<ServerMessage>,
    ) {
        self.connections.insert(
            connection_id.to_string(),
            LocalConnection {
                user_id: user_id.to_string(),
                client: client.to_string(),
                sender,
            },
        );
        self.by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    /// Drop a connection and every index pointing at it.
    pub fn remove(&self, connection_id: &str) -> Option<LocalConnection> {
        let (_, connection) = self.connections.remove(connection_id)?;

        let user_drained = self
            .by_user
            .get(&connection.user_id)
            .map(|conns| {
                conns.remove(connection_id);
                conns.is_empty()
            })
            .unwrap_or(false);
        if user_drained {
            self.by_user.remove(&connection.user_id);
        }

        if let Some((_, joined)) = self.rooms_by_conn.remove(connection_id) {
            for room in joined.iter() {
                self.remove_from_room(room.key(), connection_id);
            }
        }

        Some(connection)
    }

    pub fn join_room(&self, connection_id: &str, room: &str) {
        if !self.connections.contains_key(connection_id) {
            return;
        }
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id.to_string());
        self.rooms_by_conn
            .entry(connection_id.to_string())
            .or_default()
            .insert(room.to_string());
    }

    pub fn leave_room(&self, connection_id: &str, room: &str) {
        self.remove_from_room(room, connection_id);
        let conn_drained = self
            .rooms_by_conn
            .get(connection_id)
            .map(|joined| {
                joined.remove(room);
                joined.is_empty()
            })
            .unwrap_or(false);
        if conn_drained {
            self.rooms_by_conn.remove(connection_id);
        }
    }

    fn remove_from_room(&self, room: &str, connection_id: &str) {
        let drained = self
            .rooms
            .get(room)
            .map(|conns| {
                conns.remove(connection_id);
                conns.is_empty()
            })
            .unwrap_or(false);
        if drained {
            self.rooms.remove(room);
        }
    }

    pub fn connection_ids_for_user(&self, user_id: &str) -> Vec<String> {
        self.by_user
            .get(user_id)
            .map(|conns| conns.iter().map(|c| c.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Send to every local connection of `user_id`. Returns how many sends
    /// were accepted; a closed channel just means the connection is on its
    /// way out.
    pub fn deliver_to_user(&self, user_id: &str, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        for connection_id in self.connection_ids_for_user(user_id) {
            if let Some(connection) = self.connections.get(&connection_id) {
                if connection.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Send to every local connection joined to `room`.
    pub fn deliver_to_room(&self, room: &str, message: &ServerMessage) -> usize {
        let connection_ids: Vec<String> = self
            .rooms
            .get(room)
            .map(|conns| conns.iter().map(|c| c.key().clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for connection_id in connection_ids {
            if let Some(connection) = self.connections.get(&connection_id) {
                if connection.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sender() -> (
        UnboundedSender<ServerMessage>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_insert_and_remove_keeps_indexes_consistent() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = sender();
        let (tx2, _rx2) = sender();

        registry.insert("c1", "u1", "web", tx1);
        registry.insert("c2", "u1", "mobile", tx2);
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.user_count(), 1);

        let mut conns = registry.connection_ids_for_user("u1");
        conns.sort();
        assert_eq!(conns, vec!["c1", "c2"]);

        let removed = registry.remove("c1").unwrap();
        assert_eq!(removed.user_id, "u1");
        assert_eq!(registry.connection_ids_for_user("u1"), vec!["c2"]);

        registry.remove("c2");
        assert_eq!(registry.user_count(), 0);
        assert!(registry.connection_ids_for_user("u1").is_empty());
    }

    #[test]
    fn test_room_membership_cleared_on_disconnect() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = sender();

        registry.insert("c1", "u1", "web", tx);
        registry.join_room("c1", "post:42");
        assert_eq!(registry.room_count(), 1);

        let message = ServerMessage::Event {
            event: "comment".to_string(),
            data: serde_json::json!({"id": 7}),
        };
        assert_eq!(registry.deliver_to_room("post:42", &message), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Event { .. }
        ));

        registry.remove("c1");
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.deliver_to_room("post:42", &message), 0);
    }

    #[test]
    fn test_join_room_ignores_unknown_connection() {
        let registry = ConnectionRegistry::new();
        registry.join_room("ghost", "room");
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_deliver_to_user_counts_only_live_channels() {
        let registry = ConnectionRegistry::new();
        let (tx1, rx1) = sender();
        let (tx2, _rx2) = sender();

        registry.insert("c1", "u1", "web", tx1);
        registry.insert("c2", "u1", "mobile", tx2);
        drop(rx1); // c1's receiver is gone

        let message = ServerMessage::Event {
            event: "ping".to_string(),
            data: serde_json::Value::Null,
        };
        assert_eq!(registry.deliver_to_user("u1", &message), 1);
        assert_eq!(registry.deliver_to_user("nobody", &message), 0);
    }
}
