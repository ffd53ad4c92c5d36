//! Cross-node envelope format carried over the Bus (spec §6).

use serde::{Deserialize, Serialize};

/// Delivery priority. `Critical` bypasses compression and dedupe; `Low` is
/// dropped outright during an outage rather than queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Opaque envelope replicated between gateway nodes.
///
/// `origin_node_id` is stamped by the publisher. Consumers skip envelopes
/// whose `origin_node_id` equals their own node id unless the caller marked
/// the publish as broadcast-to-all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubEnvelope {
    pub topic: String,
    pub kind: String,
    pub origin_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_session_id: Option<String>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ttl_s")]
    pub ttl_seconds: Option<u64>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub payload: serde_json::Value,
}

impl PubSubEnvelope {
    /// True if this envelope's TTL has elapsed as of `now` (unix millis).
    pub fn expired(&self, now_unix_ms: u64) -> bool {
        match self.ttl_seconds {
            Some(ttl) => now_unix_ms.saturating_sub(self.created_at) > ttl * 1000,
            None => false,
        }
    }
}
