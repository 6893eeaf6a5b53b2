//! Cross-instance event bus
//!
//! A single broadcast channel layered on the store's pub/sub primitive.
//! Supplementary to store state, never authoritative: publishes are
//! fire-and-forget, delivery order is not guaranteed, and a lost message
//! degrades to the next sweep or heartbeat.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::protocol::BusEvent;
use crate::store::{keys, PresenceStore};

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn PresenceStore>,
}

impl EventBus {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    /// Fire-and-forget broadcast. The publish runs on a detached task and is
    /// never awaited for success; failures are logged and dropped.
    pub fn publish(&self, event: BusEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "Failed to encode bus event");
                return;
            }
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(error) = store.publish(keys::CHANNEL, &payload).await {
                tracing::debug!(%error, "Bus publish dropped");
            }
        });
    }

    /// Install the one listener loop this instance runs. Malformed payloads
    /// are dropped silently; a panicking handler is contained per event; a
    /// broken subscription is re-established after a short backoff.
    pub fn subscribe<H>(&self, handler: H) -> JoinHandle<()>
    where
        H: Fn(BusEvent) + Send + Sync + 'static,
    {
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                match store.subscribe(keys::CHANNEL).await {
                    Ok(mut stream) => {
                        tracing::info!("Bus subscription established");
                        while let Some(payload) = stream.next().await {
                            let event = match serde_json::from_str::<BusEvent>(&payload) {
                                Ok(event) => event,
                                Err(_) => {
                                    tracing::debug!("Dropped malformed bus payload");
                                    continue;
                                }
                            };
                            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                                handler(event);
                            }));
                            if outcome.is_err() {
                                tracing::error!("Bus handler panicked, continuing");
                            }
                        }
                        tracing::warn!("Bus subscription ended, resubscribing");
                    }
                    Err(error) => {
                        tracing::warn!(%error, "Bus subscribe failed, retrying");
                    }
                }
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone());

        let seen: Arc<Mutex<Vec<BusEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = bus.subscribe(move |event| sink.lock().unwrap().push(event));

        // Give the listener a beat to install its subscription.
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(BusEvent::Online {
            user_id: "u1".to_string(),
            instance_id: "i1".to_string(),
        });

        wait_until(|| !seen.lock().unwrap().is_empty()).await;
        assert!(matches!(
            &seen.lock().unwrap()[0],
            BusEvent::Online { user_id, .. } if user_id == "u1"
        ));
        listener.abort();
    }

    #[tokio::test]
    async fn test_malformed_payloads_dropped_loop_survives() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone());

        let seen: Arc<Mutex<Vec<BusEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = bus.subscribe(move |event| sink.lock().unwrap().push(event));
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.publish(keys::CHANNEL, "not even json").await.unwrap();
        store
            .publish(keys::CHANNEL, "{\"type\":\"Unknown\"}")
            .await
            .unwrap();
        bus.publish(BusEvent::Offline {
            user_id: "u2".to_string(),
            instance_id: "i1".to_string(),
        });

        wait_until(|| !seen.lock().unwrap().is_empty()).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], BusEvent::Offline { user_id, .. } if user_id == "u2"));
        listener.abort();
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_listener() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone());

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = bus.subscribe(move |event| {
            if let BusEvent::Online { user_id, .. } = event {
                if user_id == "boom" {
                    panic!("handler failure");
                }
                sink.lock().unwrap().push(user_id);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(BusEvent::Online {
            user_id: "boom".to_string(),
            instance_id: "i1".to_string(),
        });
        bus.publish(BusEvent::Online {
            user_id: "fine".to_string(),
            instance_id: "i1".to_string(),
        });

        wait_until(|| !seen.lock().unwrap().is_empty()).await;
        assert_eq!(*seen.lock().unwrap(), vec!["fine".to_string()]);
        listener.abort();
    }
}
