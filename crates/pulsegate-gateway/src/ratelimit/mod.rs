//! Sliding-window rate limiting per `(action, subject)` (spec §4.2).
//!
//! A fixed sliding window per `(action, subject)`, tracked as timestamps in
//! a bounded deque rather than a refill-on-access token bucket.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use pulsegate_core::error::{PulseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Connect,
    AuthAttempt,
    MessageSend,
    MessageEdit,
    MessageDelete,
    TypingStartStop,
    PresenceUpdate,
    VoiceJoin,
    ChannelJoinLeave,
    DmSend,
    ModerationKick,
    ModerationBan,
    Default,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Connect => "connect",
            Action::AuthAttempt => "auth_attempt",
            Action::MessageSend => "message_send",
            Action::MessageEdit => "message_edit",
            Action::MessageDelete => "message_delete",
            Action::TypingStartStop => "typing_start_stop",
            Action::PresenceUpdate => "presence_update",
            Action::VoiceJoin => "voice_join",
            Action::ChannelJoinLeave => "channel_join_leave",
            Action::DmSend => "dm_send",
            Action::ModerationKick => "moderation_kick",
            Action::ModerationBan => "moderation_ban",
            Action::Default => "default",
        }
    }

    /// Default `(limit, window)` per spec §4.2's action table.
    fn default_limits(self) -> (u32, Duration) {
        match self {
            Action::Connect => (10, Duration::from_secs(60)),
            Action::AuthAttempt => (10, Duration::from_secs(60)),
            Action::MessageSend => (30, Duration::from_secs(60)),
            Action::MessageEdit => (10, Duration::from_secs(60)),
            Action::MessageDelete => (5, Duration::from_secs(60)),
            Action::TypingStartStop => (10, Duration::from_secs(10)),
            Action::PresenceUpdate => (5, Duration::from_secs(30)),
            Action::VoiceJoin => (20, Duration::from_secs(60)),
            Action::ChannelJoinLeave => (50, Duration::from_secs(60)),
            Action::DmSend => (20, Duration::from_secs(60)),
            Action::ModerationKick => (5, Duration::from_secs(300)),
            Action::ModerationBan => (3, Duration::from_secs(300)),
            Action::Default => (100, Duration::from_secs(60)),
        }
    }
}

/// Per-`(action, subject)` window state (spec §3 `RateLimitBucket`).
struct RateLimitBucket {
    window_start: Instant,
    count: u32,
    violation_count: u32,
}

/// Config overrides layered on top of [`Action::default_limits`].
#[derive(Default, Clone)]
pub struct ActionLimits {
    overrides: std::collections::HashMap<&'static str, (u32, Duration)>,
}

impl ActionLimits {
    pub fn with_override(mut self, action: Action, limit: u32, window: Duration) -> Self {
        self.overrides.insert(action.as_str(), (limit, window));
        self
    }

    fn resolve(&self, action: Action) -> (u32, Duration) {
        self.overrides.get(action.as_str()).copied().unwrap_or_else(|| action.default_limits())
    }
}

pub struct SlidingWindowLimiter {
    buckets: DashMap<(Action, String), Mutex<RateLimitBucket>>,
    limits: ActionLimits,
}

pub struct Admission {
    pub allowed: bool,
    pub retry_after: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(limits: ActionLimits) -> Self {
        Self {
            buckets: DashMap::new(),
            limits,
        }
    }

    /// Per spec §4.2: fail-closed on internal lookup error. This
    /// implementation has no fallible lookup path, so it always succeeds in
    /// producing an admission decision.
    pub async fn admit(&self, action: Action, subject: &str) -> Result<Admission> {
        let (limit, window) = self.limits.resolve(action);
        let key = (action, subject.to_string());
        let entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Mutex::new(RateLimitBucket { window_start: Instant::now(), count: 0, violation_count: 0 }));
        let mut bucket = entry.lock().await;

        let now = Instant::now();
        if now.duration_since(bucket.window_start) >= window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count < limit {
            bucket.count += 1;
            Ok(Admission { allowed: true, retry_after: Duration::ZERO })
        } else {
            bucket.violation_count += 1;
            let retry_after = (bucket.window_start + window).saturating_duration_since(now);
            Ok(Admission { allowed: false, retry_after })
        }
    }

    /// Convenience wrapper returning [`PulseError::RateLimited`] on rejection.
    pub async fn admit_or_err(&self, action: Action, subject: &str) -> Result<()> {
        let admission = self.admit(action, subject).await?;
        if admission.allowed {
            Ok(())
        } else {
            Err(PulseError::RateLimited { retry_after_ms: admission.retry_after.as_millis() as u64 })
        }
    }

    /// Violations recorded for `(action, subject)`, used to feed the
    /// suspicion score.
    pub async fn violation_count(&self, action: Action, subject: &str) -> u32 {
        match self.buckets.get(&(action, subject.to_string())) {
            Some(entry) => entry.lock().await.violation_count,
            None => 0,
        }
    }

    /// Drop windows untouched since before `older_than` (Supervisor's rate-limit GC).
    pub async fn gc(&self, older_than: Duration) {
        let mut stale = Vec::new();
        for entry in self.buckets.iter() {
            let bucket = entry.value().lock().await;
            if bucket.window_start.elapsed() > older_than {
                stale.push(entry.key().clone());
            }
        }
        for key in stale {
            self.buckets.remove(&key);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = SlidingWindowLimiter::new(
            ActionLimits::default().with_override(Action::MessageSend, 3, Duration::from_secs(60)),
        );
        for _ in 0..3 {
            let a = limiter.admit(Action::MessageSend, "c1").await.expect("admit");
            assert!(a.allowed);
        }
        let rejected = limiter.admit(Action::MessageSend, "c1").await.expect("admit");
        assert!(!rejected.allowed);
    }

    #[tokio::test]
    async fn resets_after_window_elapses() {
        let limiter = SlidingWindowLimiter::new(
            ActionLimits::default().with_override(Action::TypingStartStop, 1, Duration::from_millis(20)),
        );
        assert!(limiter.admit(Action::TypingStartStop, "u1").await.unwrap().allowed);
        assert!(!limiter.admit(Action::TypingStartStop, "u1").await.unwrap().allowed);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(limiter.admit(Action::TypingStartStop, "u1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn subjects_are_independent() {
        let limiter = SlidingWindowLimiter::new(
            ActionLimits::default().with_override(Action::DmSend, 1, Duration::from_secs(60)),
        );
        assert!(limiter.admit(Action::DmSend, "a").await.unwrap().allowed);
        assert!(limiter.admit(Action::DmSend, "b").await.unwrap().allowed);
        assert!(!limiter.admit(Action::DmSend, "a").await.unwrap().allowed);
    }
}
