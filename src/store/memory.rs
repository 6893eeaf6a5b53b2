//! In-process store fake
//!
//! Implements the full [`PresenceStore`] contract against local tables so
//! tests can stand up several "instances" sharing one store. TTLs are
//! tracked against `tokio::time::Instant`, so paused-time tests can advance
//! the clock and watch entries expire the way Redis would expire them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{StoreError, StoreResult};
use crate::store::PresenceStore;

const BUS_CAPACITY: usize = 256;

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
struct Tables {
    strings: HashMap<String, Expiring<String>>,
    sets: HashMap<String, Expiring<HashSet<String>>>,
    sorted: HashMap<String, HashMap<String, u64>>,
}

impl Tables {
    /// Drop everything past its deadline, mirroring Redis key expiry.
    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, entry| entry.live(now));
        self.sets.retain(|_, entry| entry.live(now));
    }
}

/// Shared-store fake. One mutex over all tables gives the cross-key atomic
/// unregister the same guarantee the Lua script gives on Redis.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    bus: broadcast::Sender<(String, String)>,
    unavailable: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            bus,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate store outage: every subsequent call fails until cleared.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout(0));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        let mut tables = self.tables.lock().expect("memory store lock");
        tables.evict_expired();
        tables
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        self.check_available()?;
        self.lock().strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        Ok(self.lock().strings.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        self.lock().strings.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        self.check_available()?;
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        let mut tables = self.lock();
        if let Some(entry) = tables.strings.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        if let Some(entry) = tables.sets.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self
            .lock()
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: HashSet::new(),
                expires_at: None,
            })
            .value
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut tables = self.lock();
        let (removed, drained) = tables
            .sets
            .get_mut(key)
            .map(|entry| {
                let removed = entry.value.remove(member);
                (removed, entry.value.is_empty())
            })
            .unwrap_or((false, false));
        if drained {
            tables.sets.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|e| e.value.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> StoreResult<u64> {
        self.check_available()?;
        Ok(self.lock().sets.get(key).map(|e| e.value.len() as u64).unwrap_or(0))
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|e| e.value.contains(member))
            .unwrap_or(false))
    }

    async fn sorted_insert_if_absent(
        &self,
        key: &str,
        member: &str,
        score: u64,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let mut tables = self.lock();
        let entries = tables.sorted.entry(key.to_string()).or_default();
        if entries.contains_key(member) {
            return Ok(false);
        }
        entries.insert(member.to_string(), score);
        Ok(true)
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut tables = self.lock();
        if let Some(entries) = tables.sorted.get_mut(key) {
            entries.remove(member);
        }
        Ok(())
    }

    async fn sorted_score(&self, key: &str, member: &str) -> StoreResult<Option<u64>> {
        self.check_available()?;
        Ok(self
            .lock()
            .sorted
            .get(key)
            .and_then(|entries| entries.get(member).copied()))
    }

    async fn sorted_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let tables = self.lock();
        let Some(entries) = tables.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<(&String, &u64)> = entries.iter().collect();
        ordered.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));

        let len = ordered.len() as isize;
        let clamp = |index: isize| -> usize {
            let absolute = if index < 0 { len + index } else { index };
            absolute.clamp(0, len) as usize
        };
        let from = clamp(start);
        let to = (clamp(stop) + 1).min(len as usize);
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(ordered[from..to].iter().map(|(m, _)| (*m).clone()).collect())
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
        self.check_available()?;
        // One guard across all three tables, matching the Lua script's
        // single-threaded execution on the server.
        let mut tables = self.lock();
        let drained = tables
            .sets
            .get_mut(membership_key)
            .map(|entry| {
                entry.value.remove(token);
                entry.value.is_empty()
            })
            .unwrap_or(false);
        if drained {
            tables.sets.remove(membership_key);
        }
        tables.strings.remove(conn_key);

        let remaining = tables
            .sets
            .get(membership_key)
            .map(|e| e.value.len())
            .unwrap_or(0);
        if remaining > 0 {
            return Ok(false);
        }

        if let Some(entries) = tables.sorted.get_mut(online_key) {
            entries.remove(user_id);
        }
        let idle_drained = tables
            .sets
            .get_mut(idle_key)
            .map(|entry| {
                entry.value.remove(user_id);
                entry.value.is_empty()
            })
            .unwrap_or(false);
        if idle_drained {
            tables.sets.remove(idle_key);
        }
        Ok(true)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        self.check_available()?;
        // No receivers is fine; pub/sub has no delivery guarantee.
        let _ = self.bus.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<BoxStream<'static, String>> {
        self.check_available()?;
        let rx = self.bus.subscribe();
        let channel = channel.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((ch, payload)) if ch == channel => return Some((payload, rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed();
        Ok(stream)
    }
}
