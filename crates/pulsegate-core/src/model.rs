//! Wire-visible data shapes shared across gateway components (spec §3).
//!
//! Purely in-process caches (typing entries, rate-limit buckets, breaker
//! state) live next to the component that owns them in `pulsegate-gateway`
//! instead of here, since nothing outside that component ever serializes
//! them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Identity as seen by the gateway. Created by a `UserDirectory`; the
/// gateway never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_banned_until: Option<u64>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub two_factor_required: bool,
}

/// Room kind. Identity is the tuple `(kind, id)`; membership itself is
/// derived from session state, not stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Channel,
    Dm,
    User,
    Community,
    Voice,
    System,
}

/// A broadcast target, rendered to a topic string as `"<kind>:<id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    pub kind: RoomKind,
    pub id: String,
}

impl RoomId {
    pub fn new(kind: RoomKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Channel, id)
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(RoomKind::User, id)
    }

    /// Topic string used on the Bus, e.g. `channel:general`.
    pub fn topic(&self) -> String {
        let prefix = match self.kind {
            RoomKind::Channel => "channel",
            RoomKind::Dm => "dm",
            RoomKind::User => "user",
            RoomKind::Community => "community",
            RoomKind::Voice => "voice",
            RoomKind::System => "system",
        };
        format!("{prefix}:{}", self.id)
    }
}

/// Presence status for a user, replicated cluster-wide (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub status: PresenceStatus,
    #[serde(default)]
    pub activity: Option<String>,
    pub last_seen_at_unix_ms: u64,
    #[serde(default)]
    pub primary_node_id: Option<String>,
}

/// Cluster member record stored at `cluster.node.<node_id>` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub started_at_unix_ms: u64,
    pub last_heartbeat_at_unix_ms: u64,
    pub session_count: u64,
    pub load_score: f64,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Stored at `security.blacklist.<ip>` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub reason: String,
    pub severity: Severity,
    pub added_at_unix_ms: u64,
    #[serde(default)]
    pub expires_at_unix_ms: Option<u64>,
    pub automatic: bool,
}

impl BlacklistEntry {
    pub fn is_expired(&self, now_unix_ms: u64) -> bool {
        matches!(self.expires_at_unix_ms, Some(exp) if now_unix_ms >= exp)
    }
}
