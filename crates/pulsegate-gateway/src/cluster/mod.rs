//! Cluster membership, health, and sticky routing advice (spec §4.10).
//!
//! Node records use a plain Active/Degraded/Unreachable state enum kept
//! intentionally small, matching the terse struct style used elsewhere in
//! this crate.

pub mod sticky;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use pulsegate_core::contracts::SharedStore;
use pulsegate_core::error::Result;
use pulsegate_core::model::NodeInfo;

use crate::breaker::BreakerRegistry;
use crate::bus::{Bus, PublishOpts};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const NODE_TTL: Duration = Duration::from_secs(60);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Active,
    Degraded,
    Unreachable,
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

pub struct Coordinator {
    store: Arc<dyn SharedStore>,
    bus: Arc<Bus>,
    breakers: Arc<BreakerRegistry>,
    node_id: String,
    host: String,
    port: u16,
    version: String,
    started_at_unix_ms: u64,
    view: DashMap<String, NodeInfo>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn SharedStore>, bus: Arc<Bus>, breakers: Arc<BreakerRegistry>, node_id: String, host: String, port: u16, version: String) -> Self {
        Self {
            store,
            bus,
            breakers,
            node_id,
            host,
            port,
            version,
            started_at_unix_ms: now_unix_ms(),
            view: DashMap::new(),
        }
    }

    fn key(node_id: &str) -> String {
        format!("cluster.node.{node_id}")
    }

    pub async fn register(&self, session_count: u64, load_score: f64) -> Result<()> {
        self.heartbeat(session_count, load_score).await
    }

    pub async fn heartbeat(&self, session_count: u64, load_score: f64) -> Result<()> {
        let info = NodeInfo {
            node_id: self.node_id.clone(),
            host: self.host.clone(),
            port: self.port,
            started_at_unix_ms: self.started_at_unix_ms,
            last_heartbeat_at_unix_ms: now_unix_ms(),
            session_count,
            load_score,
            version: self.version.clone(),
        };
        let key = Self::key(&self.node_id);
        let value = serde_json::to_string(&info).unwrap_or_default();
        let store = self.store.clone();
        self.breakers.get("store").call(|| async move { store.set_ex(&key, &value, NODE_TTL.as_secs()).await }).await?;
        self.view.insert(self.node_id.clone(), info);
        Ok(())
    }

    pub async fn deregister(&self) -> Result<()> {
        let key = Self::key(&self.node_id);
        let store = self.store.clone();
        self.breakers.get("store").call(|| async move { store.delete(&key).await }).await?;
        self.view.remove(&self.node_id);
        Ok(())
    }

    /// Rescans the shared-store keyspace, updates the live view, marks
    /// unhealthy/removed members, and publishes `cluster.node.left` for
    /// anything removed this scan.
    pub async fn scan(&self) -> Result<()> {
        let store = self.store.clone();
        let keys = self.breakers.get("store").call(|| async move { store.scan_prefix("cluster.node.").await }).await?;

        let now = now_unix_ms();
        let mut seen = std::collections::HashSet::new();
        for key in keys {
            let store = self.store.clone();
            let k = key.clone();
            let raw = self.breakers.get("store").call(|| async move { store.get(&k).await }).await?;
            let Some(raw) = raw else { continue };
            let Ok(info) = serde_json::from_str::<NodeInfo>(&raw) else { continue };
            seen.insert(info.node_id.clone());
            self.view.insert(info.node_id.clone(), info);
        }

        let mut left = Vec::new();
        for entry in self.view.iter() {
            let info = entry.value();
            let age = now.saturating_sub(info.last_heartbeat_at_unix_ms);
            if age >= 4 * HEALTH_INTERVAL.as_millis() as u64 {
                left.push(info.node_id.clone());
            }
        }
        for node_id in left {
            self.view.remove(&node_id);
            let _ = self
                .bus
                .publish(
                    "cluster.node.left",
                    "cluster.node.left",
                    serde_json::json!({ "node_id": node_id }),
                    PublishOpts { priority: pulsegate_core::protocol::Priority::High, ..Default::default() },
                )
                .await;
        }

        Ok(())
    }

    pub fn health_of(&self, node_id: &str) -> NodeHealth {
        match self.view.get(node_id) {
            None => NodeHealth::Unreachable,
            Some(info) => {
                let age = now_unix_ms().saturating_sub(info.last_heartbeat_at_unix_ms);
                if age >= 4 * HEALTH_INTERVAL.as_millis() as u64 {
                    NodeHealth::Unreachable
                } else if age >= 2 * HEALTH_INTERVAL.as_millis() as u64 {
                    NodeHealth::Degraded
                } else {
                    NodeHealth::Active
                }
            }
        }
    }

    pub fn healthy_node_ids(&self) -> Vec<String> {
        self.view
            .iter()
            .filter(|e| !matches!(self.health_of(e.key()), NodeHealth::Unreachable))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Advisory-only: exposed as `X-Preferred-Node`, never enforced in
    /// routing (spec §4.10, §9 Open Questions).
    pub fn preferred_node(&self, client_key: &str) -> Option<String> {
        let nodes = self.healthy_node_ids();
        sticky::pick_node(client_key, &nodes).map(|s| s.to_string())
    }

    pub fn node_count(&self) -> usize {
        self.view.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        data: Mutex<std::collections::HashMap<String, String>>,
    }

    #[async_trait]
    impl SharedStore for FakeStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.data.lock().await.get(key).cloned())
        }
        async fn set_ex(&self, key: &str, value: &str, _ttl_seconds: u64) -> Result<()> {
            self.data.lock().await.insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.data.lock().await.remove(key);
            Ok(())
        }
        async fn incr_by(&self, _key: &str, delta: i64) -> Result<i64> {
            Ok(delta)
        }
        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self.data.lock().await.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
        }
    }

    #[tokio::test]
    async fn heartbeat_then_scan_sees_self() {
        let store = Arc::new(FakeStore::default());
        let bus = Arc::new(Bus::new("n1", None));
        let coordinator = Coordinator::new(store, bus, Arc::new(BreakerRegistry::default()), "n1".into(), "h".into(), 1, "v1".into());
        coordinator.register(0, 0.0).await.unwrap();
        coordinator.scan().await.unwrap();
        assert_eq!(coordinator.health_of("n1"), NodeHealth::Active);
    }

    #[tokio::test]
    async fn stale_node_removed_after_four_health_intervals() {
        let store = Arc::new(FakeStore::default());
        let bus = Arc::new(Bus::new("n1", None));
        let coordinator = Coordinator::new(store.clone(), bus, Arc::new(BreakerRegistry::default()), "n1".into(), "h".into(), 1, "v1".into());

        let stale = NodeInfo {
            node_id: "n2".into(),
            host: "h2".into(),
            port: 1,
            started_at_unix_ms: 0,
            last_heartbeat_at_unix_ms: 0,
            session_count: 0,
            load_score: 0.0,
            version: "v1".into(),
        };
        store.set_ex("cluster.node.n2", &serde_json::to_string(&stale).unwrap(), 60).await.unwrap();
        coordinator.scan().await.unwrap();
        assert_eq!(coordinator.health_of("n2"), NodeHealth::Unreachable);
    }
}
