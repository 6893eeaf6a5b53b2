//! Shared store abstraction
//!
//! All cross-instance coordination goes through [`PresenceStore`]: a narrow
//! key/value + set + sorted-set + pub/sub contract that the production Redis
//! backend and the in-memory test fake both implement. Instances never share
//! memory; the store is the only rendezvous point.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreResult;

/// Injected interface over the external store.
///
/// Every method is one network round-trip on the Redis backend. Callers treat
/// all of these as best-effort: the coordinator swallows write failures and
/// degrades reads to conservative defaults.
#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()>;
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()>;

    /// Returns true when the member was newly added.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;
    /// Returns true when the member was present and removed.
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn set_len(&self, key: &str) -> StoreResult<u64>;
    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Insert `member` with `score` only if absent. Returns true when the
    /// member was newly inserted, which is how offline→online transitions
    /// are detected (and how the earliest connect time wins races).
    async fn sorted_insert_if_absent(
        &self,
        key: &str,
        member: &str,
        score: u64,
    ) -> StoreResult<bool>;
    async fn sorted_remove(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn sorted_score(&self, key: &str, member: &str) -> StoreResult<Option<u64>>;
    /// Members ordered by ascending score.
    async fn sorted_range(&self, key: &str, start: isize, stop: isize)
        -> StoreResult<Vec<String>>;

    /// Atomic unregister cleanup spanning three keys: remove `token` from the
    /// membership set, delete the connection record, and — only when the
    /// membership set is now empty — drop `user_id` from the online index and
    /// idle set. Returns true when the user went offline.
    ///
    /// Atomicity here closes the race where a concurrent register for the
    /// same user lands between a count and a conditional remove.
    async fn remove_connection(
        &self,
        conn_key: &str,
        membership_key: &str,
        online_key: &str,
        idle_key: &str,
        token: &str,
        user_id: &str,
    ) -> StoreResult<bool>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    /// One live subscription stream of raw payloads. The bus owns reconnects.
    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>>;
}

/// Presence key layout in the shared store
pub mod keys {
    /// Sorted set: user_id -> first-connect epoch ms
    pub const ONLINE: &str = "presence:online";
    /// Set of user_ids currently connected but inactive
    pub const IDLE: &str = "presence:idle";
    /// Broadcast channel for presence and emission events
    pub const CHANNEL: &str = "presence:bus";

    /// TTL'd per-connection record, owned by the accepting instance
    pub fn connection(instance_id: &str, connection_id: &str) -> String {
        format!("presence:conn:{}:{}", instance_id, connection_id)
    }

    /// TTL'd per-user membership set of `instance:connection` tokens
    pub fn membership(user_id: &str) -> String {
        format!("presence:user:{}", user_id)
    }

    /// Membership token tagging a connection with its owning instance
    pub fn token(instance_id: &str, connection_id: &str) -> String {
        format!("{}:{}", instance_id, connection_id)
    }
}
