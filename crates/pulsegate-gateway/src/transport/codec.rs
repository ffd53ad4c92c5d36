//! Decode-once codec for inbound WebSocket frames (spec §6 "Client wire
//! protocol"): UTF-8 JSON `ClientFrame`s, plus ping/pong/close lifecycle
//! frames surfaced for the session loop to handle directly.

use axum::extract::ws::Message;

use pulsegate_core::error::{PulseError, Result};
use pulsegate_core::protocol::ClientFrame;

#[derive(Debug)]
pub enum Inbound {
    Frame(ClientFrame),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Binary frames are not part of the client wire protocol (spec §6: a
/// single JSON frame shape); they are rejected as a bad request rather than
/// silently ignored.
pub fn decode(msg: Message) -> Result<Inbound> {
    match msg {
        Message::Text(s) => {
            let frame: ClientFrame = serde_json::from_str(&s).map_err(|e| PulseError::BadRequest(format!("invalid frame json: {e}")))?;
            Ok(Inbound::Frame(frame))
        }
        Message::Binary(_) => Err(PulseError::BadRequest("binary frames are not supported".into())),
        Message::Ping(v) => Ok(Inbound::Ping(v)),
        Message::Pong(v) => Ok(Inbound::Pong(v)),
        Message::Close(_) => Ok(Inbound::Close),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn decodes_text_frame() {
        let msg = Message::Text(r#"{"event":"join","data":{"room_id":"c1"}}"#.to_string());
        match decode(msg).expect("decode ok") {
            Inbound::Frame(frame) => assert_eq!(frame.event, "join"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_binary_frame() {
        let msg = Message::Binary(vec![1, 2, 3]);
        assert!(decode(msg).is_err());
    }

    #[test]
    fn rejects_invalid_json() {
        let msg = Message::Text("not json".to_string());
        assert!(decode(msg).is_err());
    }
}
