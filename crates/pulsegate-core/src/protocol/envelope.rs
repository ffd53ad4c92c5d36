//! Client <-> gateway frame shapes (spec §6 "Client wire protocol").
//!
//! Frames are UTF-8 JSON objects. `data` is stored as `RawValue` so the
//! dispatcher can route on `event` without paying for a full `Value` tree
//! parse before a handler is even chosen.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Inbound client frame: `{"event": "...", "data": {...}, "id"?: "..."}`.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Outbound server frame. `data` is produced fresh per send so it is a plain
/// `serde_json::Value` rather than `RawValue`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub data: serde_json::Value,
}

impl ServerFrame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            id: None,
            data,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
