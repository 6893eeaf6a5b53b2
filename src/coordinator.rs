//! Presence coordinator
//!
//! Core logic over the shared store: connection registration, online/idle
//! transitions, the query surface, and the periodic sweep. Every operation is
//! a best-effort store round-trip; nothing here may fail the connection
//! lifecycle it is called from. Write failures are logged and surface as "no
//! transition", reads degrade to offline/empty.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::PresenceConfig;
use crate::protocol::ConnectionRecord;
use crate::store::{keys, PresenceStore};

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct PresenceCoordinator {
    instance_id: String,
    store: Arc<dyn PresenceStore>,
    connection_ttl_secs: u64,
    sweep_batch: usize,
}

impl PresenceCoordinator {
    pub fn new(instance_id: &str, store: Arc<dyn PresenceStore>, config: &PresenceConfig) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            store,
            connection_ttl_secs: config.connection_ttl_secs,
            sweep_batch: config.sweep_batch,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Record a newly accepted connection. Returns true when this was the
    /// user's first live connection anywhere, i.e. an offline→online
    /// transition the caller should announce.
    pub async fn register_connection(
        &self,
        connection_id: &str,
        user_id: &str,
        client: &str,
    ) -> bool {
        if connection_id.is_empty() || user_id.is_empty() {
            return false;
        }

        let now = epoch_ms();
        let record = ConnectionRecord {
            instance_id: self.instance_id.clone(),
            connection_id: connection_id.to_string(),
            user_id: user_id.to_string(),
            client: client.to_string(),
            connected_at_ms: now,
            last_seen_at_ms: now,
        };
        let record_json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(error) => {
                tracing::warn!(user_id = %user_id, %error, "Failed to encode connection record");
                return false;
            }
        };

        let conn_key = keys::connection(&self.instance_id, connection_id);
        let membership_key = keys::membership(user_id);
        let token = keys::token(&self.instance_id, connection_id);

        let result = async {
            self.store
                .set_with_ttl(&conn_key, &record_json, self.connection_ttl_secs)
                .await?;
            self.store.set_add(&membership_key, &token).await?;
            self.store
                .expire(&membership_key, self.connection_ttl_secs)
                .await?;
            // Insert-if-absent: only the user's first register lands, which
            // both detects the transition and keeps the earliest connect time
            // when two instances race.
            self.store
                .sorted_insert_if_absent(keys::ONLINE, user_id, now)
                .await
        }
        .await;

        match result {
            Ok(newly_online) => {
                tracing::debug!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    newly_online,
                    "Registered connection"
                );
                newly_online
            }
            Err(error) => {
                tracing::warn!(user_id = %user_id, %error, "Register failed, no transition");
                false
            }
        }
    }

    /// Remove a connection. Returns true when this was the user's last live
    /// connection anywhere. The membership removal, record deletion, and
    /// conditional online/idle cleanup run as one atomic store operation, so
    /// a concurrent register cannot be caught between a count and a remove.
    pub async fn unregister_connection(&self, connection_id: &str, user_id: &str) -> bool {
        if connection_id.is_empty() || user_id.is_empty() {
            return false;
        }

        let conn_key = keys::connection(&self.instance_id, connection_id);
        let membership_key = keys::membership(user_id);
        let token = keys::token(&self.instance_id, connection_id);

        match self
            .store
            .remove_connection(
                &conn_key,
                &membership_key,
                keys::ONLINE,
                keys::IDLE,
                &token,
                user_id,
            )
            .await
        {
            Ok(now_offline) => {
                tracing::debug!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    now_offline,
                    "Unregistered connection"
                );
                now_offline
            }
            Err(error) => {
                tracing::warn!(user_id = %user_id, %error, "Unregister failed, no transition");
                false
            }
        }
    }

    /// Heartbeat: refresh the connection record and membership-set TTLs.
    /// Raises no events; safe to call frequently.
    pub async fn touch(&self, connection_id: &str, user_id: &str, client: &str) {
        if connection_id.is_empty() || user_id.is_empty() {
            return;
        }

        let conn_key = keys::connection(&self.instance_id, connection_id);
        let membership_key = keys::membership(user_id);

        let result = async {
            let connected_at_ms = match self.store.get(&conn_key).await? {
                Some(json) => serde_json::from_str::<ConnectionRecord>(&json)
                    .map(|record| record.connected_at_ms)
                    .unwrap_or_else(|_| epoch_ms()),
                // Record already expired; the heartbeat revives it.
                None => epoch_ms(),
            };
            let record = ConnectionRecord {
                instance_id: self.instance_id.clone(),
                connection_id: connection_id.to_string(),
                user_id: user_id.to_string(),
                client: client.to_string(),
                connected_at_ms,
                last_seen_at_ms: epoch_ms(),
            };
            let record_json = serde_json::to_string(&record)?;
            self.store
                .set_with_ttl(&conn_key, &record_json, self.connection_ttl_secs)
                .await?;
            self.store
                .expire(&membership_key, self.connection_ttl_secs)
                .await
        }
        .await;

        if let Err(error) = result {
            tracing::debug!(user_id = %user_id, %error, "Heartbeat write dropped");
        }
    }

    /// Mark a connected user idle. Idempotent; returns true only when the
    /// idle flag actually flipped.
    pub async fn set_idle(&self, user_id: &str) -> bool {
        if user_id.is_empty() {
            return false;
        }
        // The idle set only ever holds online users.
        if !self.is_online(user_id).await {
            return false;
        }
        match self.store.set_add(keys::IDLE, user_id).await {
            Ok(changed) => changed,
            Err(error) => {
                tracing::debug!(user_id = %user_id, %error, "Idle toggle dropped");
                false
            }
        }
    }

    /// Clear a user's idle flag. Idempotent; returns true only when the flag
    /// actually flipped.
    pub async fn set_active(&self, user_id: &str) -> bool {
        if user_id.is_empty() {
            return false;
        }
        match self.store.set_remove(keys::IDLE, user_id).await {
            Ok(changed) => changed,
            Err(error) => {
                tracing::debug!(user_id = %user_id, %error, "Active toggle dropped");
                false
            }
        }
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        if user_id.is_empty() {
            return false;
        }
        self.store
            .sorted_score(keys::ONLINE, user_id)
            .await
            .map(|score| score.is_some())
            .unwrap_or(false)
    }

    pub async fn is_idle(&self, user_id: &str) -> bool {
        if user_id.is_empty() {
            return false;
        }
        self.store
            .set_contains(keys::IDLE, user_id)
            .await
            .unwrap_or(false)
    }

    pub async fn online_by_user_ids(&self, user_ids: &[String]) -> HashMap<String, bool> {
        let mut online = HashMap::with_capacity(user_ids.len());
        for user_id in user_ids {
            online.insert(user_id.clone(), self.is_online(user_id).await);
        }
        online
    }

    pub async fn idle_by_user_ids(&self, user_ids: &[String]) -> HashMap<String, bool> {
        let mut idle = HashMap::with_capacity(user_ids.len());
        for user_id in user_ids {
            idle.insert(user_id.clone(), self.is_idle(user_id).await);
        }
        idle
    }

    /// Every currently-online user, earliest first connect first.
    pub async fn online_user_ids(&self) -> Vec<String> {
        self.store
            .sorted_range(keys::ONLINE, 0, -1)
            .await
            .unwrap_or_default()
    }

    /// First-connect time per user; absent users are omitted.
    pub async fn last_connect_at_ms_by_user_id(
        &self,
        user_ids: &[String],
    ) -> HashMap<String, u64> {
        let mut times = HashMap::new();
        for user_id in user_ids {
            if let Ok(Some(ms)) = self.store.sorted_score(keys::ONLINE, user_id).await {
                times.insert(user_id.clone(), ms);
            }
        }
        times
    }

    /// Connection ids of `user_id` that live on this instance, for local
    /// delivery.
    pub async fn connection_ids_on_this_instance(&self, user_id: &str) -> Vec<String> {
        let prefix = format!("{}:", self.instance_id);
        self.store
            .set_members(&keys::membership(user_id))
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|token| token.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    /// Reconciliation backstop for crashed instances that never unregistered:
    /// re-count membership for a bounded batch of online users and force out
    /// anyone whose entries all expired. Returns the users taken offline.
    pub async fn sweep(&self) -> Vec<String> {
        let candidates = match self
            .store
            .sorted_range(keys::ONLINE, 0, self.sweep_batch as isize - 1)
            .await
        {
            Ok(candidates) => candidates,
            Err(error) => {
                tracing::warn!(%error, "Sweep skipped, store unavailable");
                return Vec::new();
            }
        };

        let mut offline = Vec::new();
        for user_id in candidates {
            let remaining = match self.store.set_len(&keys::membership(&user_id)).await {
                Ok(count) => count,
                Err(error) => {
                    tracing::warn!(%error, "Sweep aborted mid-batch");
                    break;
                }
            };
            if remaining > 0 {
                continue;
            }

            let removed = async {
                self.store.sorted_remove(keys::ONLINE, &user_id).await?;
                self.store.set_remove(keys::IDLE, &user_id).await
            }
            .await;
            match removed {
                Ok(_) => {
                    tracing::info!(user_id = %user_id, "Swept stale presence entry");
                    offline.push(user_id);
                }
                Err(error) => {
                    tracing::warn!(user_id = %user_id, %error, "Sweep removal dropped");
                }
            }
        }
        offline
    }
}
