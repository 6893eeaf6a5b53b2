//! Realtime emission facade
//!
//! Composes coordinator, registry, and bus into the one API the gateway and
//! business callers use. Delivery is immediate for locally-held connections
//! and rides the bus for everyone else; nothing here ever raises, because the
//! business mutation an emission follows has already committed.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::config::Config;
use crate::coordinator::PresenceCoordinator;
use crate::protocol::{BusEvent, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::store::PresenceStore;

/// Local room that receives presence transition events. Clients interested in
/// online/idle indicators join it through the gateway.
pub const PRESENCE_ROOM: &str = "presence";

pub struct RealtimeHub {
    instance_id: String,
    coordinator: PresenceCoordinator,
    registry: ConnectionRegistry,
    bus: EventBus,
}

impl RealtimeHub {
    pub fn new(config: &Config, store: Arc<dyn PresenceStore>) -> Arc<Self> {
        Arc::new(Self {
            instance_id: config.instance_id.clone(),
            coordinator: PresenceCoordinator::new(
                &config.instance_id,
                store.clone(),
                &config.presence,
            ),
            registry: ConnectionRegistry::new(),
            bus: EventBus::new(store),
        })
    }

    pub fn coordinator(&self) -> &PresenceCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Install this instance's bus listener. Called once at startup.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        self.bus.subscribe(move |event| hub.apply_bus_event(event))
    }

    /// Apply one bus event against local connections. Non-owning instances
    /// naturally no-op because their registry holds nothing for the target.
    fn apply_bus_event(&self, event: BusEvent) {
        match event {
            BusEvent::EmitToUser {
                user_id,
                event,
                data,
                instance_id,
            } => {
                // The origin already delivered to its own connections.
                if instance_id == self.instance_id {
                    return;
                }
                let delivered = self
                    .registry
                    .deliver_to_user(&user_id, &ServerMessage::Event { event, data });
                if delivered > 0 {
                    tracing::debug!(user_id = %user_id, delivered, "Delivered relayed emission");
                }
            }
            BusEvent::EmitToRoom {
                room,
                event,
                data,
                instance_id,
            } => {
                if instance_id == self.instance_id {
                    return;
                }
                let delivered = self
                    .registry
                    .deliver_to_room(&room, &ServerMessage::Event { event, data });
                if delivered > 0 {
                    tracing::debug!(room = %room, delivered, "Delivered relayed room emission");
                }
            }
            // Presence transitions fan out to the local presence room on
            // every instance, the origin included (the origin does not
            // deliver these locally, so the loopback is the single path).
            BusEvent::Online { user_id, .. } => self.notify_presence("presence:online", &user_id),
            BusEvent::Offline { user_id, .. } => self.notify_presence("presence:offline", &user_id),
            BusEvent::Idle { user_id, .. } => self.notify_presence("presence:idle", &user_id),
            BusEvent::Active { user_id, .. } => self.notify_presence("presence:active", &user_id),
        }
    }

    fn notify_presence(&self, event: &str, user_id: &str) {
        self.registry.deliver_to_room(
            PRESENCE_ROOM,
            &ServerMessage::Event {
                event: event.to_string(),
                data: serde_json::json!({ "user_id": user_id }),
            },
        );
    }

    pub async fn handle_connect(
        &self,
        connection_id: &str,
        user_id: &str,
        client: &str,
        sender: UnboundedSender<ServerMessage>,
    ) {
        self.registry.insert(connection_id, user_id, client, sender);
        if self
            .coordinator
            .register_connection(connection_id, user_id, client)
            .await
        {
            self.bus.publish(BusEvent::Online {
                user_id: user_id.to_string(),
                instance_id: self.instance_id.clone(),
            });
        }
    }

    pub async fn handle_heartbeat(&self, connection_id: &str, user_id: &str, client: &str) {
        self.coordinator.touch(connection_id, user_id, client).await;
    }

    pub async fn handle_disconnect(&self, connection_id: &str, user_id: &str) {
        self.registry.remove(connection_id);
        if self
            .coordinator
            .unregister_connection(connection_id, user_id)
            .await
        {
            self.bus.publish(BusEvent::Offline {
                user_id: user_id.to_string(),
                instance_id: self.instance_id.clone(),
            });
        }
    }

    pub async fn set_idle(&self, user_id: &str) {
        if self.coordinator.set_idle(user_id).await {
            self.bus.publish(BusEvent::Idle {
                user_id: user_id.to_string(),
                instance_id: self.instance_id.clone(),
            });
        }
    }

    pub async fn set_active(&self, user_id: &str) {
        if self.coordinator.set_active(user_id).await {
            self.bus.publish(BusEvent::Active {
                user_id: user_id.to_string(),
                instance_id: self.instance_id.clone(),
            });
        }
    }

    pub fn join_room(&self, connection_id: &str, room: &str) {
        self.registry.join_room(connection_id, room);
    }

    pub fn leave_room(&self, connection_id: &str, room: &str) {
        self.registry.leave_room(connection_id, room);
    }

    /// Push a business event to every live connection of `user_id`, on this
    /// instance immediately and on the rest of the fleet via the bus. Returns
    /// how many local connections received it.
    pub fn emit_to_user(&self, user_id: &str, event: &str, data: Value) -> usize {
        let delivered = self.registry.deliver_to_user(
            user_id,
            &ServerMessage::Event {
                event: event.to_string(),
                data: data.clone(),
            },
        );
        self.bus.publish(BusEvent::EmitToUser {
            user_id: user_id.to_string(),
            event: event.to_string(),
            data,
            instance_id: self.instance_id.clone(),
        });
        delivered
    }

    /// Room-scoped variant of [`emit_to_user`](Self::emit_to_user).
    pub fn emit_to_room(&self, room: &str, event: &str, data: Value) -> usize {
        let delivered = self.registry.deliver_to_room(
            room,
            &ServerMessage::Event {
                event: event.to_string(),
                data: data.clone(),
            },
        );
        self.bus.publish(BusEvent::EmitToRoom {
            room: room.to_string(),
            event: event.to_string(),
            data,
            instance_id: self.instance_id.clone(),
        });
        delivered
    }

    /// One reconciliation pass; announces every user the sweep forced
    /// offline.
    pub async fn sweep_once(&self) {
        for user_id in self.coordinator.sweep().await {
            self.bus.publish(BusEvent::Offline {
                user_id,
                instance_id: self.instance_id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use crate::store::{keys, MemoryStore, PresenceStore};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_config(instance_id: &str) -> Config {
        Config {
            port: 0,
            host: "127.0.0.1".to_string(),
            instance_id: instance_id.to_string(),
            redis_url: String::new(),
            presence: PresenceConfig {
                connection_ttl_secs: 90,
                idle_window_secs: 60,
                sweep_interval_secs: 30,
                sweep_batch: 200,
                heartbeat_interval_secs: 25,
                store_timeout_ms: 2000,
            },
            log_level: "info".to_string(),
        }
    }

    async fn recv_event(
        rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Option<(String, Value)> {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(ServerMessage::Event { event, data })) => Some((event, data)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_emit_to_user_crosses_instances() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let hub_a = RealtimeHub::new(&test_config("ia"), store.clone());
        let hub_b = RealtimeHub::new(&test_config("ib"), store.clone());
        let _listener_a = hub_a.start();
        let _listener_b = hub_b.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // userX's only connection lives on instance B.
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub_b.handle_connect("cb", "userX", "web", tx).await;

        let local = hub_a.emit_to_user("userX", "test", serde_json::json!({"a": 1}));
        assert_eq!(local, 0, "origin instance holds no connection for userX");

        let (event, data) = recv_event(&mut rx).await.expect("relayed event");
        assert_eq!(event, "test");
        assert_eq!(data["a"], 1);
    }

    #[tokio::test]
    async fn test_emit_to_user_not_delivered_twice_on_origin() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let hub = RealtimeHub::new(&test_config("ia"), store.clone());
        let _listener = hub.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.handle_connect("c1", "u1", "web", tx).await;

        let local = hub.emit_to_user("u1", "ping", Value::Null);
        assert_eq!(local, 1);

        assert!(recv_event(&mut rx).await.is_some());
        // The loopback from our own bus publish must be ignored.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "no duplicate delivery");
    }

    #[tokio::test]
    async fn test_emit_to_room_crosses_instances() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let hub_a = RealtimeHub::new(&test_config("ia"), store.clone());
        let hub_b = RealtimeHub::new(&test_config("ib"), store.clone());
        let _listener_b = hub_b.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub_b.handle_connect("cb", "u1", "web", tx).await;
        hub_b.join_room("cb", "post:7");

        hub_a.emit_to_room("post:7", "comment", serde_json::json!({"id": 3}));

        let (event, data) = recv_event(&mut rx).await.expect("relayed room event");
        assert_eq!(event, "comment");
        assert_eq!(data["id"], 3);
    }

    #[tokio::test]
    async fn test_presence_transitions_reach_presence_room() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let hub_a = RealtimeHub::new(&test_config("ia"), store.clone());
        let hub_b = RealtimeHub::new(&test_config("ib"), store.clone());
        let _listener_a = hub_a.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A watcher on instance A subscribes to presence updates.
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub_a.handle_connect("watcher", "admin", "web", tx).await;
        hub_a.join_room("watcher", PRESENCE_ROOM);
        // Drain the watcher's own online announcement.
        let _ = recv_event(&mut rx).await;

        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        hub_b.handle_connect("cb", "u9", "mobile", tx_b).await;

        let (event, data) = recv_event(&mut rx).await.expect("presence event");
        assert_eq!(event, "presence:online");
        assert_eq!(data["user_id"], "u9");

        hub_b.handle_disconnect("cb", "u9").await;
        let (event, data) = recv_event(&mut rx).await.expect("presence event");
        assert_eq!(event, "presence:offline");
        assert_eq!(data["user_id"], "u9");
    }

    #[tokio::test]
    async fn test_idle_transitions_published_once() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let hub = RealtimeHub::new(&test_config("ia"), store.clone());
        let _listener = hub.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.handle_connect("watcher", "admin", "web", tx).await;
        hub.join_room("watcher", PRESENCE_ROOM);
        let _ = recv_event(&mut rx).await; // admin's own online event

        hub.set_idle("admin").await;
        hub.set_idle("admin").await; // idempotent, no second event

        let (event, _) = recv_event(&mut rx).await.expect("idle event");
        assert_eq!(event, "presence:idle");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "repeat toggle raises nothing");
    }

    #[tokio::test]
    async fn test_sweep_once_announces_forced_offline() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let hub_a = RealtimeHub::new(&test_config("ia"), store.clone());
        let hub_b = RealtimeHub::new(&test_config("ib"), store.clone());
        let _listener_a = hub_a.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub_a.handle_connect("watcher", "admin", "web", tx).await;
        hub_a.join_room("watcher", PRESENCE_ROOM);
        let _ = recv_event(&mut rx).await;

        // Instance B's user crashes: membership entries vanish without an
        // unregister, leaving a stale online index entry behind.
        hub_b
            .coordinator()
            .register_connection("cb", "ghost", "web")
            .await;
        let _ = recv_event(&mut rx).await; // ghost's online event
        store
            .set_remove(&keys::membership("ghost"), &keys::token("ib", "cb"))
            .await
            .unwrap();

        hub_a.sweep_once().await;

        let (event, data) = recv_event(&mut rx).await.expect("swept offline event");
        assert_eq!(event, "presence:offline");
        assert_eq!(data["user_id"], "ghost");
        assert!(!hub_a.coordinator().is_online("ghost").await);
    }
}
