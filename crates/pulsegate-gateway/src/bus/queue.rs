//! Per-topic outage queue (spec §4.3 "Outage mode").

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use pulsegate_core::protocol::{Priority, PubSubEnvelope};

pub const MAX_QUEUE_PER_TOPIC: usize = 1000;
pub const MAX_QUEUE_AGE: Duration = Duration::from_secs(5 * 60);

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[derive(Default)]
pub struct OutageQueue {
    topics: DashMap<String, VecDeque<PubSubEnvelope>>,
    pub messages_dropped: std::sync::atomic::AtomicU64,
}

impl OutageQueue {
    /// Enqueue `envelope` while the bus transport is unavailable.
    /// `low` priority is dropped immediately per spec; callers should filter
    /// that before calling this, but it is enforced here too for safety.
    pub fn enqueue(&self, envelope: PubSubEnvelope) {
        if envelope.priority == Priority::Low {
            self.messages_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }
        let mut q = self.topics.entry(envelope.topic.clone()).or_default();
        if q.len() >= MAX_QUEUE_PER_TOPIC {
            q.pop_front();
            self.messages_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        q.push_back(envelope);
    }

    /// Flush all queued envelopes oldest-first across all topics, discarding
    /// entries older than [`MAX_QUEUE_AGE`].
    pub fn flush_all(&self) -> Vec<PubSubEnvelope> {
        let now = now_unix_ms();
        let mut flushed = Vec::new();
        for mut entry in self.topics.iter_mut() {
            while let Some(front) = entry.value_mut().pop_front() {
                if now.saturating_sub(front.created_at) <= MAX_QUEUE_AGE.as_millis() as u64 {
                    flushed.push(front);
                }
            }
        }
        flushed
    }

    pub fn depth(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|q| q.len()).unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn env(topic: &str, created_at: u64) -> PubSubEnvelope {
        PubSubEnvelope {
            topic: topic.into(),
            kind: "k".into(),
            origin_node_id: "n1".into(),
            origin_session_id: None,
            priority: Priority::High,
            ttl_seconds: None,
            created_at,
            dedupe_key: None,
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let q = OutageQueue::default();
        for i in 0..(MAX_QUEUE_PER_TOPIC + 100) {
            q.enqueue(env("x", i as u64));
        }
        assert_eq!(q.depth("x"), MAX_QUEUE_PER_TOPIC);
        assert_eq!(q.messages_dropped.load(std::sync::atomic::Ordering::Relaxed), 100);
    }

    #[test]
    fn flush_is_fifo() {
        let q = OutageQueue::default();
        q.enqueue(env("x", 1));
        q.enqueue(env("x", 2));
        q.enqueue(env("x", 3));
        let flushed = q.flush_all();
        let order: Vec<_> = flushed.iter().map(|e| e.created_at).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(q.depth("x"), 0);
    }

    #[test]
    fn low_priority_dropped_immediately() {
        let q = OutageQueue::default();
        let mut e = env("x", 1);
        e.priority = Priority::Low;
        q.enqueue(e);
        assert_eq!(q.depth("x"), 0);
        assert_eq!(q.messages_dropped.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
