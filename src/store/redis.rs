//! Redis-backed store

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::{StoreError, StoreResult};
use crate::store::PresenceStore;

/// Server-side unregister cleanup. KEYS: membership set, connection record,
/// online index, idle set. ARGV: membership token, user id. Returns 1 when
/// the last connection disappeared and the user went offline.
const UNREGISTER_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
if redis.call('SCARD', KEYS[1]) == 0 then
    redis.call('ZREM', KEYS[3], ARGV[2])
    redis.call('SREM', KEYS[4], ARGV[2])
    return 1
end
return 0
"#;

/// Production [`PresenceStore`] on a multiplexed, auto-reconnecting
/// connection. Cheap to clone; commands fail fast under `timeout_ms` so the
/// connection-accept path never stalls on a sick store.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    unregister: Arc<Script>,
    timeout_ms: u64,
}

impl RedisStore {
    pub async fn connect(url: &str, timeout_ms: u64) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            unregister: Arc::new(Script::new(UNREGISTER_SCRIPT)),
            timeout_ms,
        })
    }

    async fn with_timeout<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.timeout_ms)),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.set_ex::<_, _, ()>(key, value, ttl_secs).await })
            .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.del::<_, ()>(key).await })
            .await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.expire::<_, ()>(key, ttl_secs as i64).await })
            .await
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .with_timeout(async move { conn.sadd::<_, _, i64>(key, member).await })
            .await?;
        Ok(added == 1)
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .with_timeout(async move { conn.srem::<_, _, i64>(key, member).await })
            .await?;
        Ok(removed == 1)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.smembers::<_, Vec<String>>(key).await })
            .await
    }

    async fn set_len(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.scard::<_, u64>(key).await })
            .await
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.sismember::<_, _, bool>(key, member).await })
            .await
    }

    async fn sorted_insert_if_absent(
        &self,
        key: &str,
        member: &str,
        score: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        // ZADD NX reports how many members were newly inserted.
        let added: i64 = self
            .with_timeout(async move {
                redis::cmd("ZADD")
                    .arg(key)
                    .arg("NX")
                    .arg(score)
                    .arg(member)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(added == 1)
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.zrem::<_, _, ()>(key, member).await })
            .await
    }

    async fn sorted_score(&self, key: &str, member: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = self
            .with_timeout(async move { conn.zscore::<_, _, Option<f64>>(key, member).await })
            .await?;
        Ok(score.map(|s| s as u64))
    }

    async fn sorted_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.zrange::<_, Vec<String>>(key, start, stop).await })
            .await
    }

    async fn remove_connection(
        &self,
        conn_key: &str,
        membership_key: &str,
        online_key: &str,
        idle_key: &str,
        token: &str,
        user_id: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let script = self.unregister.clone();
        let went_offline: i64 = self
            .with_timeout(async move {
                script
                    .key(membership_key)
                    .key(conn_key)
                    .key(online_key)
                    .key(idle_key)
                    .arg(token)
                    .arg(user_id)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(went_offline == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.with_timeout(async move { conn.publish::<_, _, ()>(channel, payload).await })
            .await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>> {
        // Pub/sub needs its own connection; the manager multiplexes commands.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() })
            .boxed();
        Ok(stream)
    }
}
