//! Typed inbound event schema (spec §4.7). Unknown event names are rejected
//! by [`super::Router::dispatch`] before parsing ever reaches here.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Join {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct Leave {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageSend {
    pub channel_id: String,
    pub content: String,
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageEdit {
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageDelete {
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TypingStart {
    pub channel_id: String,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TypingStop {
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PresenceUpdate {
    pub status: String,
    #[serde(default)]
    pub activity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DmSend {
    pub recipient_id: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionAdd {
    pub content_type: String,
    pub content_id: String,
    pub reaction_type: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionRemove {
    pub content_type: String,
    pub content_id: String,
    pub reaction_type: String,
}

#[derive(Debug, Deserialize)]
pub struct VoiceJoin {
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ModerationKick {
    pub target_user_id: String,
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ModerationBan {
    pub target_user_id: String,
    pub room_id: String,
}
