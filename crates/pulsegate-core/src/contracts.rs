//! Named contracts for collaborators that live outside this crate's scope
//! (spec §1 "Out of scope"): persistent storage, full-text search, and voice
//! media token issuance. The gateway only ever depends on these traits,
//! never on a concrete database/search/media client, so that component can
//! be swapped or mocked without touching gateway code.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::User;

/// Looks up users by id. Bridges to whatever persistent user store exists
/// outside this crate.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup_user(&self, user_id: &str) -> Result<Option<User>>;

    /// Friend ids for targeted presence delivery (spec §4.9).
    async fn friends(&self, user_id: &str) -> Result<Vec<String>>;
}

/// Persists messages/reactions. Out of scope for durability guarantees
/// beyond what the store itself provides (spec §1 Non-goals).
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn store_message(&self, channel_id: &str, author_id: &str, content: &str) -> Result<String>;

    /// Returns the owning channel id so the caller can re-broadcast on the
    /// right room topic; the store is also where `author_id == original
    /// author` authorization is enforced (spec §4.7 "authorize sender==author").
    async fn edit_message(&self, message_id: &str, author_id: &str, content: &str) -> Result<String>;

    /// Returns the owning channel id (see `edit_message`).
    async fn delete_message(&self, message_id: &str, author_id: &str) -> Result<String>;
    async fn store_dm(&self, from: &str, to: &str, content: &str) -> Result<String>;
    async fn add_reaction(
        &self,
        content_type: &str,
        content_id: &str,
        user_id: &str,
        reaction_type: &str,
    ) -> Result<bool>;
    async fn remove_reaction(
        &self,
        content_type: &str,
        content_id: &str,
        user_id: &str,
        reaction_type: &str,
    ) -> Result<()>;
}

/// Full-text indexing, out of scope beyond the named contract.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, doc_id: &str, body: &str) -> Result<()>;
    async fn search(&self, query: &str) -> Result<Vec<String>>;
}

/// Issues short-lived tokens for voice/media transport negotiation, which
/// itself is out of scope (spec §1).
#[async_trait]
pub trait MediaTokenIssuer: Send + Sync {
    async fn issue_token(&self, channel_id: &str, user_id: &str) -> Result<String>;
}

/// Verifies an opaque bearer token's signature and expiry without looking up
/// the user it names.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedToken>;
}

/// Claims extracted from a verified token.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub user_id: String,
    pub issued_at_unix_s: u64,
}

/// Cross-node shared key/value store (spec §6 "Shared store keys"). Used for
/// cluster membership, presence session counts, typing reconciliation, and
/// blacklist entries that must be visible to every node.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Atomically adjust an integer counter key, returning the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
    /// List keys under a prefix (used for cluster keyspace scans).
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Cross-node transport the Bus replicates envelopes over. Implementations
/// wrap a real pub/sub system (e.g. Redis, NATS); the gateway never talks to
/// one directly outside this trait.
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn publish_remote(&self, topic: &str, payload: &str) -> Result<()>;
}
