//! Per-connection state machine (spec §4.6).
//!
//! Generalizes `transport::ws`'s ping-tick/idle-timeout select loop and the
//! teacher's `PreparedMsg`/QoS send helpers into a full reader/writer task
//! pair with a bounded, drop-oldest outbound mailbox.

pub mod registry;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::Message;
use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;

use pulsegate_core::error::{CloseCode, PulseError, Result};
use pulsegate_core::protocol::PubSubEnvelope;

use crate::bus::mailbox::Mailbox;

pub const OUTBOUND_MAILBOX: usize = 512;
pub const MAX_DROPPED_OUT: u64 = 50;
pub const DROPPED_OUT_WINDOW: Duration = Duration::from_secs(30);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    PreAuth = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for SessionState {
    fn from(v: u8) -> Self {
        match v {
            0 => SessionState::PreAuth,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// One live WebSocket (spec §3). Owned exclusively by its reader/writer
/// task pair on this node.
pub struct Session {
    pub session_id: String,
    pub user_id: Mutex<Option<String>>,
    pub node_id: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub connected_at: u64,
    last_activity_ms: AtomicU64,
    pub rooms: DashSet<String>,
    roles: DashSet<String>,
    /// Bus subscription id for each joined room topic, so `leave_room` and
    /// close-time cleanup can unsubscribe precisely (spec §4.6/§4.7: a
    /// session receives room broadcasts only for rooms it has joined).
    room_subs: DashMap<String, u64>,
    /// Shared inbox this session is subscribed to the bus with — one topic
    /// per joined room plus its own `user:<id>` topic, all delivering into
    /// this single mailbox so the session needs only one forwarder task.
    bus_inbox: Arc<Mailbox<PubSubEnvelope>>,
    outbound: Arc<Mailbox<Message>>,
    state: AtomicU8,
    dropped_out_in_window: AtomicU32,
    window_started: Mutex<Instant>,
    last_pong: Mutex<Instant>,
    events_in_second: AtomicU32,
    events_window_started: Mutex<Instant>,
    /// Set by an external caller (e.g. `Security` on a hard-block) to force
    /// this session's run loop to close with a specific code (spec §4.4).
    requested_close: Mutex<Option<CloseCode>>,
    close_notify: tokio::sync::Notify,
}

impl Session {
    pub fn new(session_id: String, node_id: String, remote_addr: String, user_agent: String) -> Self {
        Self {
            session_id,
            user_id: Mutex::new(None),
            node_id,
            remote_addr,
            user_agent,
            connected_at: now_unix_ms(),
            last_activity_ms: AtomicU64::new(now_unix_ms()),
            rooms: DashSet::new(),
            roles: DashSet::new(),
            room_subs: DashMap::new(),
            bus_inbox: Arc::new(Mailbox::new(OUTBOUND_MAILBOX)),
            outbound: Arc::new(Mailbox::new(OUTBOUND_MAILBOX)),
            state: AtomicU8::new(SessionState::PreAuth as u8),
            dropped_out_in_window: AtomicU32::new(0),
            window_started: Mutex::new(Instant::now()),
            last_pong: Mutex::new(Instant::now()),
            events_in_second: AtomicU32::new(0),
            events_window_started: Mutex::new(Instant::now()),
            requested_close: Mutex::new(None),
            close_notify: tokio::sync::Notify::new(),
        }
    }

    /// Requests that this session's run loop close with `code` at its next
    /// opportunity (spec §4.4 hard-block, §4.12 moderation kick/ban).
    pub async fn request_close(&self, code: CloseCode) {
        *self.requested_close.lock().await = Some(code);
        self.close_notify.notify_one();
    }

    pub async fn take_requested_close(&self) -> Option<CloseCode> {
        self.requested_close.lock().await.take()
    }

    /// Resolves once [`Session::request_close`] has been called.
    pub async fn closed_by_request(&self) {
        self.close_notify.notified().await;
    }

    /// Records one inbound event and returns the count observed in the
    /// current 1s window, for the `events_per_second > 100` suspicion rule
    /// (spec §4.4).
    pub async fn record_event_rate(&self) -> u32 {
        let mut started = self.events_window_started.lock().await;
        if started.elapsed() >= Duration::from_secs(1) {
            *started = Instant::now();
            self.events_in_second.store(0, Ordering::Relaxed);
        }
        self.events_in_second.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn touch_activity(&self) {
        self.last_activity_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub async fn record_pong(&self) {
        *self.last_pong.lock().await = Instant::now();
    }

    pub async fn heartbeat_alive(&self) -> bool {
        self.last_pong.lock().await.elapsed() < HEARTBEAT_TIMEOUT
    }

    pub fn outbound_handle(&self) -> Arc<Mailbox<Message>> {
        self.outbound.clone()
    }

    /// Enqueue an outbound frame. Drop-oldest on overflow; when drops exceed
    /// `MAX_DROPPED_OUT` within `DROPPED_OUT_WINDOW`, the caller should close
    /// the session with `slow_consumer` (spec §4.6).
    pub async fn send(&self, msg: Message) -> Result<()> {
        let before = self.outbound.dropped.load(Ordering::Relaxed);
        self.outbound.push(msg).await;
        let after = self.outbound.dropped.load(Ordering::Relaxed);
        if after > before {
            self.record_drop().await;
        }
        Ok(())
    }

    async fn record_drop(&self) {
        let mut started = self.window_started.lock().await;
        if started.elapsed() > DROPPED_OUT_WINDOW {
            *started = Instant::now();
            self.dropped_out_in_window.store(0, Ordering::Relaxed);
        }
        self.dropped_out_in_window.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_chronic_slow_consumer(&self) -> bool {
        self.dropped_out_in_window.load(Ordering::Relaxed) as u64 >= MAX_DROPPED_OUT
    }

    pub fn bus_inbox(&self) -> Arc<Mailbox<PubSubEnvelope>> {
        self.bus_inbox.clone()
    }

    /// Joins `room`'s bus topic on this session's shared inbox, so the
    /// session's forwarder task starts receiving that room's broadcasts.
    pub fn join_room(&self, bus: &crate::bus::Bus, room: impl Into<String>) {
        let room = room.into();
        if self.rooms.insert(room.clone()) {
            let id = bus.subscribe_shared(room.clone(), self.bus_inbox.clone());
            self.room_subs.insert(room, id);
        }
    }

    pub fn leave_room(&self, bus: &crate::bus::Bus, room: &str) {
        self.rooms.remove(room);
        if let Some((_, id)) = self.room_subs.remove(room) {
            bus.unsubscribe(room, id);
        }
    }

    /// Unsubscribes every joined room's bus topic (spec §4.6 "Leave all
    /// rooms" on close).
    pub fn leave_all_rooms(&self, bus: &crate::bus::Bus) {
        for room in self.room_set() {
            self.leave_room(bus, &room);
        }
    }

    pub fn room_set(&self) -> HashSet<String> {
        self.rooms.iter().map(|r| r.clone()).collect()
    }

    pub async fn set_user(&self, user_id: String) {
        *self.user_id.lock().await = Some(user_id);
    }

    pub async fn user_id(&self) -> Option<String> {
        self.user_id.lock().await.clone()
    }

    /// Snapshots `User.roles` onto the session at authentication time, so
    /// later admin-gated handlers (`moderation.*`) don't need a fresh
    /// `UserDirectory` round-trip per event.
    pub fn set_roles(&self, roles: impl IntoIterator<Item = String>) {
        self.roles.clear();
        for role in roles {
            self.roles.insert(role);
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

pub fn close_frame(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(axum::extract::ws::CloseFrame {
        code: code as u16,
        reason: reason.to_string().into(),
    }))
}

pub fn client_code_of(err: &PulseError) -> &'static str {
    err.client_code().as_str()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drop_oldest_overflow_is_counted() {
        let session = Session::new("s1".into(), "n1".into(), "1.2.3.4".into(), "ua".into());
        for _ in 0..(OUTBOUND_MAILBOX + 10) {
            session.send(Message::Ping(vec![])).await.unwrap();
        }
        assert!(session.outbound.dropped.load(Ordering::Relaxed) >= 10);
    }

    #[tokio::test]
    async fn chronic_drops_trip_slow_consumer() {
        let session = Session::new("s1".into(), "n1".into(), "1.2.3.4".into(), "ua".into());
        for _ in 0..(OUTBOUND_MAILBOX + MAX_DROPPED_OUT as usize + 5) {
            session.send(Message::Ping(vec![])).await.unwrap();
        }
        assert!(session.is_chronic_slow_consumer());
    }

    #[test]
    fn room_membership_tracks_joins_and_leaves() {
        let session = Session::new("s1".into(), "n1".into(), "1.2.3.4".into(), "ua".into());
        let bus = crate::bus::Bus::new("n1", None);
        session.join_room(&bus, "channel:general");
        assert!(session.room_set().contains("channel:general"));
        session.leave_room(&bus, "channel:general");
        assert!(!session.room_set().contains("channel:general"));
    }

    #[tokio::test]
    async fn joining_a_room_subscribes_the_shared_inbox() {
        let bus = crate::bus::Bus::new("n1", None);
        let session = Session::new("s1".into(), "n1".into(), "1.2.3.4".into(), "ua".into());
        session.join_room(&bus, "channel:general");

        bus.publish("channel:general", "room.message.new", serde_json::json!({"x": 1}), Default::default())
            .await
            .unwrap();
        let envelope = session.bus_inbox().recv().await;
        assert_eq!(envelope.kind, "room.message.new");

        session.leave_room(&bus, "channel:general");
        bus.publish("channel:general", "room.message.new", serde_json::json!({"x": 2}), Default::default())
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_millis(20), session.bus_inbox().recv()).await;
        assert!(result.is_err(), "no further deliveries after leaving the room");
    }

    #[tokio::test]
    async fn event_rate_counts_within_window_and_resets_after() {
        let session = Session::new("s1".into(), "n1".into(), "1.2.3.4".into(), "ua".into());
        assert_eq!(session.record_event_rate().await, 1);
        assert_eq!(session.record_event_rate().await, 2);
        assert_eq!(session.record_event_rate().await, 3);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(session.record_event_rate().await, 1);
    }
}
