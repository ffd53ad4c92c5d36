//! Wire format tests for client frames and cross-node envelopes.

use pulsegate_core::protocol::{ClientFrame, Priority, PubSubEnvelope};

#[test]
fn client_frame_parses_lazily() {
    let raw = r#"{"event":"message.send","data":{"channel_id":"c1","content":"hi"},"id":"abc"}"#;
    let frame: ClientFrame = serde_json::from_str(raw).expect("valid frame");
    assert_eq!(frame.event, "message.send");
    assert_eq!(frame.id.as_deref(), Some("abc"));
    assert!(frame.data.is_some());
}

#[test]
fn client_frame_allows_missing_data_and_id() {
    let raw = r#"{"event":"typing.stop"}"#;
    let frame: ClientFrame = serde_json::from_str(raw).expect("valid frame");
    assert_eq!(frame.event, "typing.stop");
    assert!(frame.data.is_none());
    assert!(frame.id.is_none());
}

#[test]
fn envelope_round_trips_and_respects_ttl() {
    let env = PubSubEnvelope {
        topic: "channel:c1".into(),
        kind: "message.new".into(),
        origin_node_id: "node-a".into(),
        origin_session_id: None,
        priority: Priority::High,
        ttl_seconds: Some(5),
        created_at: 1_000,
        dedupe_key: None,
        payload: serde_json::json!({"text": "hi"}),
    };

    let s = serde_json::to_string(&env).expect("serialize");
    let back: PubSubEnvelope = serde_json::from_str(&s).expect("deserialize");
    assert_eq!(back.topic, "channel:c1");
    assert_eq!(back.priority, Priority::High);

    assert!(!env.expired(1_000 + 4_000));
    assert!(env.expired(1_000 + 5_001));
}

#[test]
fn priority_orders_low_to_critical() {
    assert!(Priority::Low < Priority::Normal);
    assert!(Priority::Normal < Priority::High);
    assert!(Priority::High < Priority::Critical);
}
