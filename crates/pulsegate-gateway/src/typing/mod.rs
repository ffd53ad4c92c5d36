//! Debounced, TTL'd typing indicator state, mirrored cross-node via the Bus
//! (spec §4.8).
//!
//! No direct teacher analogue; grounded on `Presence`'s
//! `DashMap<RoomId, DashSet<UserId>>` sharding pattern.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use pulsegate_core::contracts::SharedStore;
use pulsegate_core::protocol::{Priority, PubSubEnvelope};

use crate::bus::{Bus, PublishOpts};
use crate::ratelimit::{Action, SlidingWindowLimiter};

/// Marks a mirrored entry created from a remote node's broadcast rather
/// than a local `start()` call, so reconcile/mirror can tell which
/// entries they own without touching genuinely local typists.
const REMOTE_SESSION_PREFIX: &str = "remote:";

pub const MIN_START_INTERVAL: Duration = Duration::from_secs(3);
pub const MAX_TYPING_USERS: usize = 10;
pub const TYPING_TTL: Duration = Duration::from_secs(8);
pub const DEBOUNCE: Duration = Duration::from_secs(2);
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const GC_INTERVAL: Duration = Duration::from_secs(30);
pub const STALE_AFTER: Duration = Duration::from_secs(8 + 5);

#[derive(Debug, Clone)]
pub struct TypingEntry {
    pub user_id: String,
    pub display_name: String,
    pub device: String,
    pub session_id: String,
    pub started_at: Instant,
    pub last_update_at: Instant,
}

struct RoomState {
    entries: DashMap<String, TypingEntry>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
    auto_stop_tasks: DashMap<String, JoinHandle<()>>,
    debounced_events: std::sync::atomic::AtomicU64,
}

impl Default for RoomState {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            debounce_task: Mutex::new(None),
            auto_stop_tasks: DashMap::new(),
            debounced_events: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

pub struct TypingTracker {
    rooms: DashMap<String, Arc<RoomState>>,
    last_start: DashMap<(String, String), Instant>,
    bus: Arc<Bus>,
    rate_limiter: Arc<SlidingWindowLimiter>,
    store: Arc<dyn SharedStore>,
}

impl TypingTracker {
    pub fn new(bus: Arc<Bus>, rate_limiter: Arc<SlidingWindowLimiter>, store: Arc<dyn SharedStore>) -> Self {
        Self {
            rooms: DashMap::new(),
            last_start: DashMap::new(),
            bus,
            rate_limiter,
            store,
        }
    }

    /// Subscribes to every room's typing topic and mirrors remote-origin
    /// updates onto the local room map, so a user typing on another node
    /// shows up here too (spec §4.8 "remote handlers mirror the local
    /// map"). Self-originated echoes are skipped by `origin_node_id`.
    pub fn spawn_mirror(self: &Arc<Self>, node_id: String) {
        let (_, mailbox) = self.bus.subscribe("typing.*");
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let envelope = mailbox.recv().await;
                if envelope.origin_node_id == node_id {
                    continue;
                }
                this.apply_remote_snapshot(&envelope);
            }
        });
    }

    fn apply_remote_snapshot(&self, envelope: &PubSubEnvelope) {
        let Some(room) = envelope.payload.get("room").and_then(|v| v.as_str()) else { return };
        let Some(users) = envelope.payload.get("typing").and_then(|v| v.as_array()) else { return };
        let remote_ids: HashSet<String> = users.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();

        let state = self.room_state(room);
        let now = Instant::now();
        for user_id in &remote_ids {
            state.entries.entry(user_id.clone()).or_insert_with(|| TypingEntry {
                user_id: user_id.clone(),
                display_name: user_id.clone(),
                device: "remote".to_string(),
                session_id: format!("{REMOTE_SESSION_PREFIX}{}", envelope.origin_node_id),
                started_at: now,
                last_update_at: now,
            });
        }
        state.entries.retain(|user_id, entry| !entry.session_id.starts_with(REMOTE_SESSION_PREFIX) || remote_ids.contains(user_id));
    }

    /// Compares each room's local snapshot against the shared TTL-keyed
    /// store, repairing drift in both directions, and refreshes the store
    /// entry so other nodes converge too (spec §4.8 reconcile, every
    /// [`RECONCILE_INTERVAL`]). Rooms known only to the store (recorded by
    /// another node, nothing local yet) are picked up via `scan_prefix`.
    pub async fn reconcile(&self) {
        let stored_keys = self.store.scan_prefix("typing.rooms.").await.unwrap_or_default();
        let mut rooms: HashSet<String> = stored_keys.iter().filter_map(|k| k.strip_prefix("typing.rooms.").map(str::to_string)).collect();
        rooms.extend(self.rooms.iter().map(|e| e.key().clone()));

        for room in rooms {
            let state = self.room_state(&room);
            let key = format!("typing.rooms.{room}");

            let stored: HashSet<String> = self
                .store
                .get(&key)
                .await
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
                .unwrap_or_default()
                .into_iter()
                .collect();
            let local: HashSet<String> = state.entries.iter().map(|e| e.user_id.clone()).collect();

            let now = Instant::now();
            for user_id in stored.difference(&local) {
                state.entries.entry(user_id.clone()).or_insert_with(|| TypingEntry {
                    user_id: user_id.clone(),
                    display_name: user_id.clone(),
                    device: "remote".to_string(),
                    session_id: format!("{REMOTE_SESSION_PREFIX}reconcile"),
                    started_at: now,
                    last_update_at: now,
                });
            }

            let snapshot: Vec<String> = state.entries.iter().map(|e| e.user_id.clone()).collect();
            let value = serde_json::to_string(&snapshot).unwrap_or_default();
            let _ = self.store.set_ex(&key, &value, TYPING_TTL.as_secs()).await;
        }
    }

    fn room_state(&self, room: &str) -> Arc<RoomState> {
        self.rooms.entry(room.to_string()).or_insert_with(|| Arc::new(RoomState::default())).clone()
    }

    pub async fn start(&self, user_id: &str, room: &str, device: &str, session_id: &str, display_name: &str) {
        let admission = self.rate_limiter.admit(Action::TypingStartStop, user_id).await;
        if matches!(admission, Ok(a) if !a.allowed) {
            return;
        }

        let refresh_key = (room.to_string(), user_id.to_string());
        if let Some(last) = self.last_start.get(&refresh_key) {
            if last.elapsed() < MIN_START_INTERVAL {
                let state = self.room_state(room);
                if let Some(mut entry) = state.entries.get_mut(user_id) {
                    entry.last_update_at = Instant::now();
                }
                return;
            }
        }
        self.last_start.insert(refresh_key, Instant::now());

        let state = self.room_state(room);
        if state.entries.len() >= MAX_TYPING_USERS && !state.entries.contains_key(user_id) {
            return;
        }

        let now = Instant::now();
        state.entries.insert(
            user_id.to_string(),
            TypingEntry {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                device: device.to_string(),
                session_id: session_id.to_string(),
                started_at: now,
                last_update_at: now,
            },
        );

        self.schedule_auto_stop(room.to_string(), user_id.to_string());
        self.schedule_debounced_broadcast(room.to_string()).await;
    }

    /// Removes the entry and broadcasts stop, debounced like Start (spec
    /// §4.8: "remove entry; cancel timer; broadcast stop (debounced)").
    pub async fn stop(&self, user_id: &str, room: &str) {
        let state = self.room_state(room);
        state.entries.remove(user_id);
        if let Some((_, task)) = state.auto_stop_tasks.remove(user_id) {
            task.abort();
        }
        self.schedule_debounced_broadcast(room.to_string()).await;
    }

    /// Bypasses debounce entirely (spec §4.8 `OnMessageSent`).
    pub async fn on_message_sent(&self, user_id: &str, room: &str) {
        let state = self.room_state(room);
        state.entries.remove(user_id);
        if let Some((_, task)) = state.auto_stop_tasks.remove(user_id) {
            task.abort();
        }
        let mut slot = state.debounce_task.lock().await;
        if let Some(pending) = slot.take() {
            pending.abort();
        }
        drop(slot);
        publish_snapshot(&self.bus, room, &state).await;
    }

    pub async fn on_session_close(&self, session_id: &str) {
        for room_entry in self.rooms.iter() {
            let room = room_entry.key().clone();
            let to_remove: Vec<String> = room_entry
                .value()
                .entries
                .iter()
                .filter(|e| e.session_id == session_id)
                .map(|e| e.user_id.clone())
                .collect();
            for user_id in to_remove {
                self.stop(&user_id, &room).await;
            }
        }
    }

    fn schedule_auto_stop(&self, room: String, user_id: String) {
        let state = self.room_state(&room);
        if let Some((_, old)) = state.auto_stop_tasks.remove(&user_id) {
            old.abort();
        }
        let state_for_task = state.clone();
        let user_for_task = user_id.clone();
        let bus_for_task = self.bus.clone();
        let room_for_task = room.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(TYPING_TTL).await;
            state_for_task.entries.remove(&user_for_task);
            publish_snapshot(&bus_for_task, &room_for_task, &state_for_task).await;
        });
        state.auto_stop_tasks.insert(user_id, handle);
    }

    /// Coalesce broadcasts: schedule after `DEBOUNCE`; a subsequent Start in
    /// the window resets the timer and counts the dropped pending broadcast.
    async fn schedule_debounced_broadcast(&self, room: String) {
        let state = self.room_state(&room);
        let mut slot = state.debounce_task.lock().await;
        if let Some(existing) = slot.take() {
            existing.abort();
            state.debounced_events.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let bus = self.bus.clone();
        let state_for_task = state.clone();
        let room_for_task = room.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            publish_snapshot(&bus, &room_for_task, &state_for_task).await;
        });
        *slot = Some(handle);
    }

    pub fn debounced_events(&self, room: &str) -> u64 {
        self.room_state(room).debounced_events.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn active_users(&self, room: &str) -> Vec<String> {
        self.room_state(room).entries.iter().map(|e| e.user_id.clone()).collect()
    }

    /// Stale-entry GC on a 30s timer (Supervisor janitor).
    pub fn gc(&self) {
        for room in self.rooms.iter() {
            room.value().entries.retain(|_, e| e.last_update_at.elapsed() < STALE_AFTER);
        }
    }
}

async fn publish_snapshot(bus: &Bus, room: &str, state: &RoomState) {
    let users: Vec<String> = state.entries.iter().map(|e| e.user_id.clone()).collect();
    let topic = format!("typing.{room}.update");
    let _ = bus
        .publish(
            &topic,
            "typing.update",
            serde_json::json!({ "room": room, "typing": users }),
            PublishOpts { priority: Priority::Normal, ..Default::default() },
        )
        .await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::infra::InMemorySharedStore;

    fn test_store() -> Arc<dyn SharedStore> {
        Arc::new(InMemorySharedStore::default())
    }

    #[tokio::test]
    async fn start_then_stop_then_start_broadcasts_twice() {
        // Spec §8 round-trip law: Start -> Stop -> Start yields exactly two
        // broadcasts after debounce, provided Stop lands inside the first
        // Start's debounce window (so it coalesces into one broadcast).
        let bus = Arc::new(Bus::new("n1", None));
        let (_, mailbox) = bus.subscribe("typing.*");
        let tracker = TypingTracker::new(bus, Arc::new(SlidingWindowLimiter::new(Default::default())), test_store());

        tracker.start("u1", "r1", "web", "s1", "Alice").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        tracker.stop("u1", "r1").await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;

        tracker.start("u1", "r1", "web", "s1", "Alice").await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;

        let mut received = 0;
        while let Ok(_env) = tokio::time::timeout(Duration::from_millis(20), mailbox.recv()).await {
            received += 1;
        }
        assert_eq!(received, 2, "start+stop coalesce into one broadcast, second start produces the other");
    }

    #[tokio::test]
    async fn room_capacity_is_enforced() {
        let bus = Arc::new(Bus::new("n1", None));
        let tracker = TypingTracker::new(bus, Arc::new(SlidingWindowLimiter::new(Default::default())), test_store());
        for i in 0..MAX_TYPING_USERS {
            tracker.start(&format!("u{i}"), "r1", "web", &format!("s{i}"), "x").await;
        }
        tracker.start("overflow", "r1", "web", "s-overflow", "x").await;
        assert_eq!(tracker.active_users("r1").len(), MAX_TYPING_USERS);
    }

    #[tokio::test]
    async fn session_close_stops_all_rooms_for_that_session() {
        let bus = Arc::new(Bus::new("n1", None));
        let tracker = TypingTracker::new(bus, Arc::new(SlidingWindowLimiter::new(Default::default())), test_store());
        tracker.start("u1", "r1", "web", "s1", "Alice").await;
        tracker.start("u1", "r2", "web", "s1", "Alice").await;
        tracker.on_session_close("s1").await;
        assert!(tracker.active_users("r1").is_empty());
        assert!(tracker.active_users("r2").is_empty());
    }

    #[tokio::test]
    async fn reconcile_pulls_in_a_user_recorded_by_another_node() {
        let bus = Arc::new(Bus::new("n1", None));
        let store = test_store();
        store.set_ex("typing.rooms.r1", &serde_json::to_string(&vec!["remote-user"]).unwrap(), 8).await.unwrap();
        let tracker = TypingTracker::new(bus, Arc::new(SlidingWindowLimiter::new(Default::default())), store);

        tracker.reconcile().await;
        assert!(tracker.active_users("r1").contains(&"remote-user".to_string()));
    }

    fn remote_update(room: &str, typing: Vec<&str>) -> PubSubEnvelope {
        PubSubEnvelope {
            topic: format!("typing.{room}.update"),
            kind: "typing.update".to_string(),
            origin_node_id: "n2".to_string(),
            origin_session_id: None,
            priority: Priority::Normal,
            ttl_seconds: None,
            created_at: 0,
            dedupe_key: None,
            payload: serde_json::json!({ "room": room, "typing": typing }),
        }
    }

    #[tokio::test]
    async fn mirror_applies_and_retracts_remote_typing() {
        let bus = Arc::new(Bus::new("n1", None));
        let tracker = Arc::new(TypingTracker::new(bus.clone(), Arc::new(SlidingWindowLimiter::new(Default::default())), test_store()));
        tracker.spawn_mirror("n1".to_string());

        bus.deliver_remote(remote_update("r1", vec!["u-remote"])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.active_users("r1"), vec!["u-remote".to_string()]);

        bus.deliver_remote(remote_update("r1", vec![])).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tracker.active_users("r1").is_empty());
    }
}
