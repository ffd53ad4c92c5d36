//! Pub/sub bridge: local fan-out plus cross-node replication with an outage
//! queue (spec §4.3).
//!
//! Local fan-out uses an in-process `DashMap<Topic, Vec<Subscriber>>`
//! registry with a bounded drop-oldest mailbox per subscriber. Cross-node
//! replication goes through [`pulsegate_core::contracts::BusTransport`],
//! wrapped in a [`CircuitBreaker`].

pub mod backoff;
pub mod mailbox;
pub mod queue;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use pulsegate_core::contracts::BusTransport;
use pulsegate_core::error::Result;
use pulsegate_core::protocol::{Priority, PubSubEnvelope};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use mailbox::Mailbox;
use queue::OutageQueue;

pub const SUBSCRIBER_MAILBOX: usize = 256;
const DEDUPE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOpts {
    pub priority: Priority,
    pub ttl_seconds: Option<u64>,
    pub dedupe: bool,
    pub dedupe_key: Option<&'static str>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    Queued,
    Dropped,
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

type Subscriber = Arc<Mailbox<PubSubEnvelope>>;

pub struct Bus {
    node_id: String,
    subscribers: DashMap<String, DashMap<u64, Subscriber>>,
    next_sub_id: AtomicU64,
    transport: Option<Arc<dyn BusTransport>>,
    breaker: Arc<CircuitBreaker>,
    outage: OutageQueue,
    dedupe_seen: DashMap<(String, String), Instant>,
    transport_state: AsyncMutex<TransportState>,
    reconnect_attempts: AtomicU32,
}

impl Bus {
    pub fn new(node_id: impl Into<String>, transport: Option<Arc<dyn BusTransport>>) -> Self {
        let initial_state = if transport.is_some() { TransportState::Connecting } else { TransportState::Disconnected };
        Self {
            node_id: node_id.into(),
            subscribers: DashMap::new(),
            next_sub_id: AtomicU64::new(1),
            transport,
            breaker: Arc::new(CircuitBreaker::new("bus", BreakerConfig::default())),
            outage: OutageQueue::default(),
            dedupe_seen: DashMap::new(),
            transport_state: AsyncMutex::new(initial_state),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register an in-process listener. Returns a mailbox to poll and a
    /// subscription id to later [`Bus::unsubscribe`].
    pub fn subscribe(&self, topic: impl Into<String>) -> (u64, Subscriber) {
        let mailbox = Arc::new(Mailbox::new(SUBSCRIBER_MAILBOX));
        let id = self.subscribe_shared(topic, mailbox.clone());
        (id, mailbox)
    }

    /// Register an existing mailbox under `topic`, so one subscriber (e.g. a
    /// Session's single inbound mailbox) can be subscribed to many topics at
    /// once — one per room it has joined, plus its own `user:<id>` topic.
    pub fn subscribe_shared(&self, topic: impl Into<String>, mailbox: Subscriber) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.entry(topic.into()).or_default().insert(id, mailbox);
        id
    }

    pub fn unsubscribe(&self, topic: &str, id: u64) {
        if let Some(subs) = self.subscribers.get(topic) {
            subs.remove(&id);
        }
    }

    /// Publish `payload` under `kind` on `topic`. Visits local subscribers
    /// first, then replicates remotely unless the envelope originated
    /// remotely (callers use [`Bus::deliver_remote`] for that path).
    pub async fn publish(
        &self,
        topic: &str,
        kind: &str,
        payload: serde_json::Value,
        opts: PublishOpts,
    ) -> Result<PublishOutcome> {
        if opts.dedupe && opts.priority != Priority::Critical {
            if let Some(key) = opts.dedupe_key {
                let dedupe_id = (topic.to_string(), key.to_string());
                if let Some(seen) = self.dedupe_seen.get(&dedupe_id) {
                    if seen.elapsed() < DEDUPE_WINDOW {
                        return Ok(PublishOutcome::Dropped);
                    }
                }
                self.dedupe_seen.insert(dedupe_id, Instant::now());
            }
        }

        let envelope = PubSubEnvelope {
            topic: topic.to_string(),
            kind: kind.to_string(),
            origin_node_id: self.node_id.clone(),
            origin_session_id: None,
            priority: opts.priority,
            ttl_seconds: opts.ttl_seconds,
            created_at: now_unix_ms(),
            dedupe_key: opts.dedupe_key.map(|s| s.to_string()),
            payload,
        };

        self.deliver_local(&envelope).await;
        self.replicate_remote(envelope, opts.priority).await
    }

    async fn deliver_local(&self, envelope: &PubSubEnvelope) {
        for key in self.matching_topics(&envelope.topic) {
            if let Some(entry) = self.subscribers.get(&key) {
                for sub in entry.value().iter() {
                    sub.value().push(envelope.clone()).await;
                }
            }
        }
    }

    /// Topics are hierarchical dot paths; a subscription on `a.b` only
    /// matches `a.b` and `a.b.*` suffixes registered explicitly with a
    /// trailing `.*`, never a bare prefix match (spec §4.3).
    fn matching_topics(&self, topic: &str) -> Vec<String> {
        let mut hits = Vec::new();
        if self.subscribers.contains_key(topic) {
            hits.push(topic.to_string());
        }
        for entry in self.subscribers.iter() {
            if let Some(prefix) = entry.key().strip_suffix(".*") {
                if topic.starts_with(prefix) && topic.len() > prefix.len() {
                    hits.push(entry.key().clone());
                }
            }
        }
        hits
    }

    async fn replicate_remote(&self, envelope: PubSubEnvelope, priority: Priority) -> Result<PublishOutcome> {
        let Some(transport) = self.transport.clone() else {
            return Ok(PublishOutcome::Delivered);
        };

        let serialized = serde_json::to_string(&envelope).unwrap_or_default();
        let topic = envelope.topic.clone();
        let result = self
            .breaker
            .call(|| async move { transport.publish_remote(&topic, &serialized).await })
            .await;

        match result {
            Ok(()) => {
                *self.transport_state.lock().await = TransportState::Connected;
                self.reconnect_attempts.store(0, Ordering::Relaxed);
                Ok(PublishOutcome::Delivered)
            }
            Err(_) if matches!(priority, Priority::High | Priority::Critical) => {
                self.outage.enqueue(envelope);
                *self.transport_state.lock().await = TransportState::Reconnecting;
                Ok(PublishOutcome::Queued)
            }
            Err(_) => Ok(PublishOutcome::Dropped),
        }
    }

    /// Deliver a remote-origin envelope to local subscribers only (spec
    /// §4.3 "Remote-origin envelopes are delivered only to local
    /// subscribers").
    pub async fn deliver_remote(&self, envelope: PubSubEnvelope) {
        if envelope.origin_node_id == self.node_id {
            return;
        }
        if envelope.expired(now_unix_ms()) {
            return;
        }
        self.deliver_local(&envelope).await;
    }

    /// Flush the outage queue after reconnection, delivering remotely.
    pub async fn flush_outage_queue(&self) {
        let Some(transport) = self.transport.clone() else { return };
        for envelope in self.outage.flush_all() {
            let serialized = serde_json::to_string(&envelope).unwrap_or_default();
            let topic = envelope.topic.clone();
            let transport = transport.clone();
            let _ = self.breaker.call(|| async move { transport.publish_remote(&topic, &serialized).await }).await;
        }
    }

    pub fn messages_dropped(&self) -> u64 {
        self.outage.messages_dropped.load(Ordering::Relaxed)
    }

    /// One-shot reachability check for the remote transport, breaker-wrapped
    /// like every other transport call. A bus with no remote transport
    /// configured (single-node dev mode) has nothing to probe and is always
    /// reachable (spec §7 "combined bus+store unreachable" boot check).
    pub async fn probe(&self) -> Result<()> {
        let Some(transport) = self.transport.clone() else { return Ok(()) };
        self.breaker.call(|| async move { transport.publish_remote("health.probe", "{}").await }).await
    }

    pub async fn transport_state(&self) -> TransportState {
        *self.transport_state.lock().await
    }

    /// Reconnection loop: call from a supervised task. Backs off with full
    /// jitter and enters degraded mode (probing every 30s) after
    /// [`backoff::DEGRADED_AFTER_ATTEMPTS`] consecutive failures.
    pub async fn reconnect_once(&self) -> bool {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt >= backoff::DEGRADED_AFTER_ATTEMPTS {
            *self.transport_state.lock().await = TransportState::Failed;
            tokio::time::sleep(backoff::DEGRADED_PROBE_INTERVAL).await;
        } else {
            tokio::time::sleep(backoff::next_delay(attempt)).await;
        }

        let Some(transport) = self.transport.clone() else { return false };
        let probe = transport.publish_remote("health.probe", "{}").await;
        if probe.is_ok() {
            self.reconnect_attempts.store(0, Ordering::Relaxed);
            *self.transport_state.lock().await = TransportState::Connected;
            self.flush_outage_queue().await;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_subscriber_receives_published_envelope() {
        let bus = Bus::new("node-a", None);
        let (_, mailbox) = bus.subscribe("channel:c1");
        bus.publish("channel:c1", "message.new", serde_json::json!({"x": 1}), PublishOpts::default())
            .await
            .expect("publish");
        let received = mailbox.recv().await;
        assert_eq!(received.kind, "message.new");
    }

    #[tokio::test]
    async fn suffix_wildcard_matches_nested_topic() {
        let bus = Bus::new("node-a", None);
        let (_, mailbox) = bus.subscribe("typing.*");
        bus.publish("typing.room1.update", "typing.update", serde_json::json!({}), PublishOpts::default())
            .await
            .expect("publish");
        let received = mailbox.recv().await;
        assert_eq!(received.topic, "typing.room1.update");
    }

    #[tokio::test]
    async fn bare_topic_does_not_match_child_path() {
        let bus = Bus::new("node-a", None);
        let (_, mailbox) = bus.subscribe("a.b");
        bus.publish("a.b.c", "k", serde_json::json!({}), PublishOpts::default()).await.expect("publish");
        let result = tokio::time::timeout(Duration::from_millis(20), mailbox.recv()).await;
        assert!(result.is_err(), "subscriber on a.b must not receive a.b.c");
    }

    #[tokio::test]
    async fn dedupe_suppresses_within_window() {
        let bus = Bus::new("node-a", None);
        let opts = PublishOpts { dedupe: true, dedupe_key: Some("k1"), ..Default::default() };
        let first = bus.publish("t", "k", serde_json::json!({}), opts).await.unwrap();
        let second = bus.publish("t", "k", serde_json::json!({}), opts).await.unwrap();
        assert_eq!(first, PublishOutcome::Delivered);
        assert_eq!(second, PublishOutcome::Dropped);
    }

    #[tokio::test]
    async fn remote_origin_envelope_skips_self() {
        let bus = Bus::new("node-a", None);
        let envelope = PubSubEnvelope {
            topic: "t".into(),
            kind: "k".into(),
            origin_node_id: "node-a".into(),
            origin_session_id: None,
            priority: Priority::Normal,
            ttl_seconds: None,
            created_at: now_unix_ms(),
            dedupe_key: None,
            payload: serde_json::json!({}),
        };
        let (_, mailbox) = bus.subscribe("t");
        bus.deliver_remote(envelope).await;
        let result = tokio::time::timeout(Duration::from_millis(20), mailbox.recv()).await;
        assert!(result.is_err(), "self-originated envelope must be skipped");
    }
}
