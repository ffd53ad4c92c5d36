//! Per-user online/away/offline tracking, cross-node via shared store and
//! the Bus (spec §4.9).
//!
//! Generalizes `realtime::core::presence::Presence`'s room_to_users /
//! user_to_rooms maps into a `user_id -> PresenceEntry` map plus a
//! shared-store-backed cross-node session count.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use pulsegate_core::contracts::{SharedStore, UserDirectory};
use pulsegate_core::error::Result;
use pulsegate_core::model::{PresenceEntry, PresenceStatus};

use crate::breaker::BreakerRegistry;
use crate::bus::{Bus, PublishOpts};

pub const PRESENCE_TTL: std::time::Duration = std::time::Duration::from_secs(300);

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub struct PresenceTracker {
    local: DashMap<String, PresenceEntry>,
    store: Arc<dyn SharedStore>,
    bus: Arc<Bus>,
    directory: Arc<dyn UserDirectory>,
    breakers: Arc<BreakerRegistry>,
    node_id: String,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn SharedStore>, bus: Arc<Bus>, directory: Arc<dyn UserDirectory>, breakers: Arc<BreakerRegistry>, node_id: String) -> Self {
        Self { local: DashMap::new(), store, bus, directory, breakers, node_id }
    }

    /// `Update(user, status, activity?)`: stores locally, writes through with
    /// TTL 300s, publishes `presence.changed` low-priority, and delivers to
    /// friends on `user:<friend_id>`. A no-op update (unchanged value) is
    /// skipped entirely — no store write, no broadcast (spec §8 idempotence
    /// law).
    pub async fn update(&self, user_id: &str, status: PresenceStatus, activity: Option<String>) -> Result<()> {
        if let Some(existing) = self.local.get(user_id) {
            if existing.status == status && existing.activity == activity {
                return Ok(());
            }
        }

        let entry = PresenceEntry {
            status,
            activity,
            last_seen_at_unix_ms: now_unix_ms(),
            primary_node_id: Some(self.node_id.clone()),
        };
        self.local.insert(user_id.to_string(), entry.clone());

        let key = format!("presence.{user_id}");
        let value = serde_json::to_string(&entry).unwrap_or_default();
        let store = self.store.clone();
        let breaker = self.breakers.get("store");
        let _ = breaker.call(|| async move { store.set_ex(&key, &value, PRESENCE_TTL.as_secs()).await }).await;

        let _ = self
            .bus
            .publish(
                &format!("user:{user_id}"),
                "presence.changed",
                serde_json::json!({ "user_id": user_id, "entry": entry }),
                PublishOpts { priority: pulsegate_core::protocol::Priority::Low, ..Default::default() },
            )
            .await;

        let directory = self.directory.clone();
        let uid = user_id.to_string();
        let friends = self.breakers.get("auth").call(|| async move { directory.friends(&uid).await }).await.unwrap_or_default();
        for friend_id in friends {
            let _ = self
                .bus
                .publish(
                    &format!("user:{friend_id}"),
                    "presence.changed",
                    serde_json::json!({ "user_id": user_id, "entry": entry }),
                    PublishOpts { priority: pulsegate_core::protocol::Priority::Low, ..Default::default() },
                )
                .await;
        }

        Ok(())
    }

    /// Cross-node CAS-decrement of `presence.count.<user_id>`; when it
    /// reaches zero, flips the user offline.
    pub async fn on_session_closed(&self, user_id: &str) -> Result<()> {
        let key = format!("presence.count.{user_id}");
        let store = self.store.clone();
        let remaining = self
            .breakers
            .get("store")
            .call(|| {
                let store = store.clone();
                let key = key.clone();
                async move { store.incr_by(&key, -1).await }
            })
            .await
            .unwrap_or(0);

        if remaining <= 0 {
            self.update(user_id, PresenceStatus::Offline, None).await?;
        }
        Ok(())
    }

    pub async fn on_session_opened(&self, user_id: &str) -> Result<()> {
        let key = format!("presence.count.{user_id}");
        let store = self.store.clone();
        let count = self
            .breakers
            .get("store")
            .call(|| {
                let store = store.clone();
                let key = key.clone();
                async move { store.incr_by(&key, 1).await }
            })
            .await
            .unwrap_or(1);

        if count <= 1 {
            self.update(user_id, PresenceStatus::Online, None).await?;
        }
        Ok(())
    }

    /// Cluster failover (spec §4.10): a departed node's session-count
    /// contributions are decremented and flipped offline where exhausted,
    /// the same as a local session close. Attribution is by
    /// `primary_node_id`, the last node to report each user's presence.
    pub async fn on_node_left(&self, node_id: &str) -> Result<()> {
        let affected: Vec<String> = self
            .local
            .iter()
            .filter(|e| e.value().primary_node_id.as_deref() == Some(node_id) && e.value().status != PresenceStatus::Offline)
            .map(|e| e.key().clone())
            .collect();
        for user_id in affected {
            self.on_session_closed(&user_id).await?;
        }
        Ok(())
    }

    pub fn get(&self, user_id: &str) -> Option<PresenceEntry> {
        self.local.get(user_id).map(|e| e.clone())
    }

    /// Presence GC every 5 min (Supervisor janitor): drop entries past TTL
    /// that never got a cross-node refresh.
    pub fn gc(&self) {
        let now = now_unix_ms();
        self.local.retain(|_, e| now.saturating_sub(e.last_seen_at_unix_ms) < PRESENCE_TTL.as_millis() as u64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    struct MemStore {
        writes: AtomicU32,
        counter: AtomicI64,
    }

    #[async_trait]
    impl SharedStore for MemStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn set_ex(&self, _key: &str, _value: &str, _ttl_seconds: u64) -> Result<()> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn incr_by(&self, _key: &str, delta: i64) -> Result<i64> {
            Ok(self.counter.fetch_add(delta, Ordering::Relaxed) + delta)
        }
        async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    struct NoFriends;
    #[async_trait]
    impl UserDirectory for NoFriends {
        async fn lookup_user(&self, _user_id: &str) -> Result<Option<pulsegate_core::model::User>> {
            Ok(None)
        }
        async fn friends(&self, _user_id: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn unchanged_update_is_idempotent() {
        let store = Arc::new(MemStore { writes: AtomicU32::new(0), counter: AtomicI64::new(0) });
        let bus = Arc::new(Bus::new("n1", None));
        let tracker = PresenceTracker::new(store.clone(), bus, Arc::new(NoFriends), Arc::new(BreakerRegistry::default()), "n1".into());

        tracker.update("u1", PresenceStatus::Online, None).await.unwrap();
        tracker.update("u1", PresenceStatus::Online, None).await.unwrap();
        assert_eq!(store.writes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn decrement_to_zero_flips_offline() {
        let store = Arc::new(MemStore { writes: AtomicU32::new(0), counter: AtomicI64::new(1) });
        let bus = Arc::new(Bus::new("n1", None));
        let tracker = PresenceTracker::new(store, bus, Arc::new(NoFriends), Arc::new(BreakerRegistry::default()), "n1".into());
        tracker.update("u1", PresenceStatus::Online, None).await.unwrap();
        tracker.on_session_closed("u1").await.unwrap();
        assert_eq!(tracker.get("u1").unwrap().status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn node_departure_flips_its_users_offline() {
        let store = Arc::new(MemStore { writes: AtomicU32::new(0), counter: AtomicI64::new(1) });
        let bus = Arc::new(Bus::new("n1", None));
        let tracker = PresenceTracker::new(store, bus, Arc::new(NoFriends), Arc::new(BreakerRegistry::default()), "n1".into());
        tracker.update("u1", PresenceStatus::Online, None).await.unwrap();

        tracker.on_node_left("n2").await.unwrap();
        assert_eq!(tracker.get("u1").unwrap().status, PresenceStatus::Online, "u1 belongs to n1, not the departed node");

        tracker.on_node_left("n1").await.unwrap();
        assert_eq!(tracker.get("u1").unwrap().status, PresenceStatus::Offline);
    }
}
