//! Per-IP connection-rate DDoS detector (spec §4.4 check 4).

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

pub const DDOS_WINDOW: Duration = Duration::from_secs(60);
pub const DDOS_BLOCK_DURATION: Duration = Duration::from_secs(5 * 60);

pub struct DdosDetector {
    threshold: u32,
    windows: DashMap<IpAddr, Mutex<VecDeque<Instant>>>,
}

impl DdosDetector {
    pub fn new(threshold: u32) -> Self {
        Self { threshold, windows: DashMap::new() }
    }

    /// Record a connection attempt from `addr`; returns `true` if the
    /// rolling 60s count just crossed `threshold`.
    pub async fn record_connect(&self, addr: IpAddr) -> bool {
        let entry = self.windows.entry(addr).or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut window = entry.value().lock().await;
        let now = Instant::now();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > DDOS_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        window.push_back(now);
        window.len() as u32 > self.threshold
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crosses_threshold_after_enough_connects() {
        let detector = DdosDetector::new(3);
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        assert!(!detector.record_connect(ip).await);
        assert!(!detector.record_connect(ip).await);
        assert!(!detector.record_connect(ip).await);
        assert!(detector.record_connect(ip).await);
    }
}
