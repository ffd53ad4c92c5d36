//! Dispatches validated inbound events (spec §4.7).
//!
//! Generalizes `dispatch::Dispatcher::dispatch_text`'s `DashMap`-keyed
//! handler registry into a typed match per the fixed event schema (Design
//! Note: "replace unbounded emitter style with a typed event schema").
//! Every handler runs `RateLimiter.Admit -> Security.ValidateContent ->
//! Handler`, with external-dependency calls wrapped in the relevant
//! circuit breaker.

pub mod handlers;

use std::net::IpAddr;
use std::sync::Arc;

use serde_json::value::RawValue;

use pulsegate_core::contracts::{ContentStore, MediaTokenIssuer};
use pulsegate_core::error::{PulseError, Result};
use pulsegate_core::model::{PresenceStatus, RoomId, RoomKind};

use crate::breaker::BreakerRegistry;
use crate::bus::{Bus, PublishOpts};
use crate::presence::PresenceTracker;
use crate::ratelimit::{Action, SlidingWindowLimiter};
use crate::security::Security;
use crate::session::Session;
use crate::typing::TypingTracker;

pub struct Router {
    pub rate_limiter: Arc<SlidingWindowLimiter>,
    pub security: Arc<Security>,
    pub content_store: Arc<dyn ContentStore>,
    pub media_issuer: Arc<dyn MediaTokenIssuer>,
    pub typing: Arc<TypingTracker>,
    pub presence: Arc<PresenceTracker>,
    pub bus: Arc<Bus>,
    pub breakers: Arc<BreakerRegistry>,
}

fn rate_action_for(event: &str) -> Action {
    match event {
        "join" | "leave" => Action::ChannelJoinLeave,
        "message.send" => Action::MessageSend,
        "message.edit" => Action::MessageEdit,
        "message.delete" => Action::MessageDelete,
        "typing.start" | "typing.stop" => Action::TypingStartStop,
        "presence.update" => Action::PresenceUpdate,
        "dm.send" => Action::DmSend,
        "voice.join" => Action::VoiceJoin,
        "moderation.kick" => Action::ModerationKick,
        "moderation.ban" => Action::ModerationBan,
        _ => Action::Default,
    }
}

impl Router {
    /// Dispatches one inbound event for `session`. Returns the payload to
    /// reply on the originating session only (`voice.join`, acks); broadcast
    /// side effects go out through `self.bus` directly.
    pub async fn dispatch(&self, session: &Session, user_id: &str, event: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        self.rate_limiter.admit_or_err(rate_action_for(event), user_id).await?;

        let raw_str = data.map(|d| d.get()).unwrap_or("{}");
        let outcome = self.security.validate_content(event, raw_str)?;
        if outcome.raise_suspicion {
            if let Ok(addr) = session.remote_addr.parse::<IpAddr>() {
                self.security.raise_suspicion(addr, Security::PRIVILEGE_ESCALATION_PENALTY).await;
            }
        }

        match event {
            "join" => self.handle_join(session, data).await,
            "leave" => self.handle_leave(session, data).await,
            "message.send" => self.handle_message_send(session, user_id, data).await,
            "message.edit" => self.handle_message_edit(user_id, data).await,
            "message.delete" => self.handle_message_delete(user_id, data).await,
            "typing.start" => self.handle_typing_start(session, user_id, data).await,
            "typing.stop" => self.handle_typing_stop(session, user_id, data).await,
            "presence.update" => self.handle_presence_update(user_id, data).await,
            "dm.send" => self.handle_dm_send(user_id, data).await,
            "reaction.add" => self.handle_reaction_add(user_id, data).await,
            "reaction.remove" => self.handle_reaction_remove(user_id, data).await,
            "voice.join" => self.handle_voice_join(user_id, data).await,
            "moderation.kick" => self.handle_moderation_kick(session, user_id, data).await,
            "moderation.ban" => self.handle_moderation_ban(session, user_id, data).await,
            other => {
                if let Ok(addr) = session.remote_addr.parse::<IpAddr>() {
                    self.security.raise_suspicion(addr, crate::security::Security::UNKNOWN_EVENT_PENALTY).await;
                }
                Err(PulseError::BadRequest(format!("unknown event: {other}")))
            }
        }
    }

    fn parse<'a, T: serde::Deserialize<'a>>(data: Option<&'a RawValue>) -> Result<T> {
        let raw = data.ok_or_else(|| PulseError::BadRequest("missing data".into()))?;
        serde_json::from_str(raw.get()).map_err(|e| PulseError::BadRequest(format!("invalid fields: {e}")))
    }

    async fn handle_join(&self, session: &Session, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::Join = Self::parse(data)?;
        let room = RoomId::new(RoomKind::Channel, req.room_id.clone());
        session.join_room(&self.bus, room.topic());
        self.bus
            .publish(&room.topic(), "room.presence", serde_json::json!({"room_id": req.room_id, "delta": 1}), PublishOpts::default())
            .await?;
        Ok(serde_json::json!({"room_id": req.room_id}))
    }

    async fn handle_leave(&self, session: &Session, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::Leave = Self::parse(data)?;
        let room = RoomId::new(RoomKind::Channel, req.room_id.clone());
        session.leave_room(&self.bus, &room.topic());
        self.bus
            .publish(&room.topic(), "room.presence", serde_json::json!({"room_id": req.room_id, "delta": -1}), PublishOpts::default())
            .await?;
        Ok(serde_json::json!({"room_id": req.room_id}))
    }

    async fn handle_message_send(&self, session: &Session, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::MessageSend = Self::parse(data)?;
        let store = self.content_store.clone();
        let (channel_id, content, author) = (req.channel_id.clone(), req.content.clone(), user_id.to_string());
        let message_id = self
            .breakers
            .get("content_store")
            .call(|| async move { store.store_message(&channel_id, &author, &content).await })
            .await?;

        let room = RoomId::channel(req.channel_id.clone());
        self.bus
            .publish(
                &room.topic(),
                "room.message.new",
                serde_json::json!({"message_id": message_id, "channel_id": req.channel_id, "author_id": user_id, "content": req.content, "ref_id": req.ref_id, "mentions": req.mentions}),
                PublishOpts::default(),
            )
            .await?;

        self.typing.on_message_sent(user_id, &room.topic()).await;
        Ok(serde_json::json!({"message_id": message_id}))
    }

    async fn handle_message_edit(&self, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::MessageEdit = Self::parse(data)?;
        let store = self.content_store.clone();
        let (message_id, content, author) = (req.message_id.clone(), req.content.clone(), user_id.to_string());
        let channel_id = self
            .breakers
            .get("content_store")
            .call(|| async move { store.edit_message(&message_id, &author, &content).await })
            .await?;

        let room = RoomId::channel(channel_id);
        self.bus
            .publish(&room.topic(), "room.message.edit", serde_json::json!({"message_id": req.message_id, "content": req.content}), PublishOpts::default())
            .await?;
        Ok(serde_json::json!({"message_id": req.message_id}))
    }

    async fn handle_message_delete(&self, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::MessageDelete = Self::parse(data)?;
        let store = self.content_store.clone();
        let (message_id, author) = (req.message_id.clone(), user_id.to_string());
        let channel_id = self
            .breakers
            .get("content_store")
            .call(|| async move { store.delete_message(&message_id, &author).await })
            .await?;

        let room = RoomId::channel(channel_id);
        self.bus
            .publish(&room.topic(), "room.message.delete", serde_json::json!({"message_id": req.message_id}), PublishOpts::default())
            .await?;
        Ok(serde_json::json!({"message_id": req.message_id}))
    }

    async fn handle_typing_start(&self, session: &Session, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::TypingStart = Self::parse(data)?;
        let room = RoomId::channel(req.channel_id.clone());
        self.typing
            .start(user_id, &room.topic(), req.device.as_deref().unwrap_or("web"), &session.session_id, user_id)
            .await;
        Ok(serde_json::json!({}))
    }

    async fn handle_typing_stop(&self, _session: &Session, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::TypingStop = Self::parse(data)?;
        let room = RoomId::channel(req.channel_id.clone());
        self.typing.stop(user_id, &room.topic()).await;
        Ok(serde_json::json!({}))
    }

    async fn handle_presence_update(&self, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::PresenceUpdate = Self::parse(data)?;
        let status = parse_status(&req.status)?;
        self.presence.update(user_id, status, req.activity).await?;
        Ok(serde_json::json!({}))
    }

    async fn handle_dm_send(&self, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::DmSend = Self::parse(data)?;
        let store = self.content_store.clone();
        let (from, to, content) = (user_id.to_string(), req.recipient_id.clone(), req.content.clone());
        let message_id = self.breakers.get("content_store").call(|| async move { store.store_dm(&from, &to, &content).await }).await?;

        for target in [RoomId::user(req.recipient_id.clone()), RoomId::user(user_id.to_string())] {
            self.bus
                .publish(&target.topic(), "room.dm.new", serde_json::json!({"message_id": message_id, "from": user_id, "to": req.recipient_id, "content": req.content}), PublishOpts::default())
                .await?;
        }
        Ok(serde_json::json!({"message_id": message_id}))
    }

    async fn handle_reaction_add(&self, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::ReactionAdd = Self::parse(data)?;
        let store = self.content_store.clone();
        let (ct, cid, rt, uid) = (req.content_type.clone(), req.content_id.clone(), req.reaction_type.clone(), user_id.to_string());
        let inserted = self.breakers.get("content_store").call(|| async move { store.add_reaction(&ct, &cid, &uid, &rt).await }).await?;

        if inserted {
            self.bus
                .publish(
                    &format!("{}:{}", req.content_type, req.content_id),
                    "room.reaction.added",
                    serde_json::json!({"content_type": req.content_type, "content_id": req.content_id, "user_id": user_id, "reaction_type": req.reaction_type}),
                    PublishOpts::default(),
                )
                .await?;
        }
        Ok(serde_json::json!({"added": inserted}))
    }

    async fn handle_reaction_remove(&self, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::ReactionRemove = Self::parse(data)?;
        let store = self.content_store.clone();
        let (ct, cid, rt, uid) = (req.content_type.clone(), req.content_id.clone(), req.reaction_type.clone(), user_id.to_string());
        self.breakers.get("content_store").call(|| async move { store.remove_reaction(&ct, &cid, &uid, &rt).await }).await?;

        self.bus
            .publish(
                &format!("{}:{}", req.content_type, req.content_id),
                "room.reaction.removed",
                serde_json::json!({"content_type": req.content_type, "content_id": req.content_id, "user_id": user_id, "reaction_type": req.reaction_type}),
                PublishOpts::default(),
            )
            .await?;
        Ok(serde_json::json!({"removed": true}))
    }

    async fn handle_voice_join(&self, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        let req: handlers::VoiceJoin = Self::parse(data)?;
        let issuer = self.media_issuer.clone();
        let (channel_id, uid) = (req.channel_id.clone(), user_id.to_string());
        let token = self.breakers.get("media_token").call(|| async move { issuer.issue_token(&channel_id, &uid).await }).await?;
        Ok(serde_json::json!({"channel_id": req.channel_id, "token": token}))
    }

    async fn handle_moderation_kick(&self, session: &Session, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        Self::require_admin(session)?;
        let req: handlers::ModerationKick = Self::parse(data)?;
        self.bus
            .publish("moderation.kick", "moderation.kick", serde_json::json!({"actor": user_id, "target": req.target_user_id, "room_id": req.room_id}), PublishOpts::default())
            .await?;
        Ok(serde_json::json!({}))
    }

    async fn handle_moderation_ban(&self, session: &Session, user_id: &str, data: Option<&RawValue>) -> Result<serde_json::Value> {
        Self::require_admin(session)?;
        let req: handlers::ModerationBan = Self::parse(data)?;
        self.bus
            .publish("moderation.ban", "moderation.ban", serde_json::json!({"actor": user_id, "target": req.target_user_id, "room_id": req.room_id}), PublishOpts::default())
            .await?;
        Ok(serde_json::json!({}))
    }

    /// `moderation.*` handlers require an admin role (spec §4.7 "admin
    /// check"); the role snapshot is taken on `Session` at auth time.
    fn require_admin(session: &Session) -> Result<()> {
        if session.has_role("admin") {
            Ok(())
        } else {
            Err(PulseError::NotAllowed("admin role required".into()))
        }
    }
}

fn parse_status(raw: &str) -> Result<PresenceStatus> {
    match raw {
        "online" => Ok(PresenceStatus::Online),
        "idle" => Ok(PresenceStatus::Idle),
        "dnd" => Ok(PresenceStatus::Dnd),
        "invisible" => Ok(PresenceStatus::Invisible),
        "offline" => Ok(PresenceStatus::Offline),
        other => Err(PulseError::BadRequest(format!("invalid status: {other}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::infra::{InMemoryContentStore, InMemorySharedStore, InMemoryUserDirectory, StaticMediaTokenIssuer};
    use crate::ratelimit::ActionLimits;
    use crate::session::registry::SessionRegistry;

    fn test_router() -> (Router, Arc<Bus>) {
        let bus = Arc::new(Bus::new("n1", None));
        let rate_limiter = Arc::new(SlidingWindowLimiter::new(ActionLimits::default()));
        let sessions = Arc::new(SessionRegistry::default());
        let security = Arc::new(Security::new(1_000_000, 1 << 20, Vec::new(), Vec::new(), rate_limiter.clone(), sessions));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let store = Arc::new(InMemorySharedStore::default());
        let typing = Arc::new(TypingTracker::new(bus.clone(), rate_limiter.clone(), store.clone()));
        let directory = Arc::new(InMemoryUserDirectory::default());
        let presence = Arc::new(PresenceTracker::new(store, bus.clone(), directory, breakers.clone(), "n1".into()));
        let router = Router {
            rate_limiter,
            security,
            content_store: Arc::new(InMemoryContentStore::default()),
            media_issuer: Arc::new(StaticMediaTokenIssuer),
            typing,
            presence,
            bus: bus.clone(),
            breakers,
        };
        (router, bus)
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new("s1".into(), "n1".into(), "1.2.3.4".into(), "ua".into()))
    }

    fn raw(json: serde_json::Value) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    #[tokio::test]
    async fn joining_a_room_delivers_its_broadcasts_to_the_session() {
        let (router, bus) = test_router();
        let session = session();

        router.dispatch(&session, "u1", "join", Some(&raw(serde_json::json!({"room_id": "general"})))).await.unwrap();

        let room = RoomId::new(RoomKind::Channel, "general".to_string());
        bus.publish(&room.topic(), "room.message.new", serde_json::json!({"x": 1}), PublishOpts::default()).await.unwrap();

        let envelope = session.bus_inbox().recv().await;
        assert_eq!(envelope.kind, "room.message.new");
    }

    #[tokio::test]
    async fn moderation_kick_requires_admin_role() {
        let (router, _bus) = test_router();
        let session = session();

        let data = raw(serde_json::json!({"target_user_id": "u2", "room_id": "general"}));
        let err = router.dispatch(&session, "u1", "moderation.kick", Some(&data)).await.unwrap_err();
        assert!(matches!(err, PulseError::NotAllowed(_)));

        session.set_roles(["admin".to_string()]);
        router.dispatch(&session, "u1", "moderation.kick", Some(&data)).await.unwrap();
    }

    #[tokio::test]
    async fn moderation_ban_requires_admin_role() {
        let (router, _bus) = test_router();
        let session = session();

        let data = raw(serde_json::json!({"target_user_id": "u2", "room_id": "general"}));
        let err = router.dispatch(&session, "u1", "moderation.ban", Some(&data)).await.unwrap_err();
        assert!(matches!(err, PulseError::NotAllowed(_)));

        session.set_roles(["admin".to_string()]);
        router.dispatch(&session, "u1", "moderation.ban", Some(&data)).await.unwrap();
    }
}
