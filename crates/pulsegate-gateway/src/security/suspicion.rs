//! Per-address suspicion scoring with decay (spec §4.4).

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

pub const ALERT_THRESHOLD: u32 = 50;
pub const HARD_BLOCK_THRESHOLD: u32 = 100;
const DECAY_AMOUNT: u32 = 5;
const DECAY_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub const HIGH_EVENT_RATE_PENALTY: u32 = 10;
pub const PRIVILEGE_ESCALATION_PENALTY: u32 = 20;
pub const UNKNOWN_EVENT_PENALTY: u32 = 5;

struct ScoreState {
    score: u32,
    last_decay: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    None,
    Alert,
    HardBlock,
}

#[derive(Default)]
pub struct SuspicionTracker {
    scores: DashMap<IpAddr, Mutex<ScoreState>>,
}

impl SuspicionTracker {
    fn decay_locked(state: &mut ScoreState) {
        let elapsed = state.last_decay.elapsed();
        let ticks = (elapsed.as_secs() / DECAY_INTERVAL.as_secs()) as u32;
        if ticks > 0 {
            state.score = state.score.saturating_sub(DECAY_AMOUNT * ticks);
            state.last_decay = Instant::now();
        }
    }

    /// Add `delta` to `addr`'s score, applying pending decay first. Returns
    /// the highest threshold crossed by this update.
    pub async fn add(&self, addr: IpAddr, delta: u32) -> Crossing {
        let entry = self.scores.entry(addr).or_insert_with(|| Mutex::new(ScoreState { score: 0, last_decay: Instant::now() }));
        let mut state = entry.value().lock().await;
        Self::decay_locked(&mut state);
        let before = state.score;
        state.score = state.score.saturating_add(delta);
        let after = state.score;

        if before < HARD_BLOCK_THRESHOLD && after >= HARD_BLOCK_THRESHOLD {
            Crossing::HardBlock
        } else if before < ALERT_THRESHOLD && after >= ALERT_THRESHOLD {
            Crossing::Alert
        } else {
            Crossing::None
        }
    }

    pub async fn score(&self, addr: IpAddr) -> u32 {
        match self.scores.get(&addr) {
            Some(entry) => {
                let mut state = entry.value().lock().await;
                Self::decay_locked(&mut state);
                state.score
            }
            None => 0,
        }
    }

    /// Periodic decay tick independent of any specific update (Supervisor's
    /// security GC); touches every tracked address.
    pub async fn decay_all(&self) {
        for entry in self.scores.iter() {
            let mut state = entry.value().lock().await;
            Self::decay_locked(&mut state);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crossing_alert_then_hard_block() {
        let tracker = SuspicionTracker::default();
        let ip: IpAddr = "198.51.100.2".parse().unwrap();
        assert_eq!(tracker.add(ip, 40).await, Crossing::None);
        assert_eq!(tracker.add(ip, 10).await, Crossing::Alert);
        assert_eq!(tracker.add(ip, 50).await, Crossing::HardBlock);
    }
}
