//! IP blacklist (spec §4.4 check 1, §3 `BlacklistEntry`).

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use pulsegate_core::model::{BlacklistEntry, Severity};

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[derive(Default)]
pub struct Blacklist {
    entries: DashMap<IpAddr, BlacklistEntry>,
}

impl Blacklist {
    /// Returns the entry if `addr` is listed and not expired.
    pub fn check(&self, addr: IpAddr) -> Option<BlacklistEntry> {
        match self.entries.get(&addr) {
            Some(entry) if !entry.is_expired(now_unix_ms()) => Some(entry.clone()),
            Some(_) => {
                self.entries.remove(&addr);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, addr: IpAddr, reason: impl Into<String>, severity: Severity, ttl: Option<std::time::Duration>, automatic: bool) {
        let now = now_unix_ms();
        self.entries.insert(
            addr,
            BlacklistEntry {
                reason: reason.into(),
                severity,
                added_at_unix_ms: now,
                expires_at_unix_ms: ttl.map(|d| now + d.as_millis() as u64),
                automatic,
            },
        );
    }

    /// Remove expired entries (Supervisor's security GC).
    pub fn gc(&self) {
        let now = now_unix_ms();
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn expired_entry_is_not_enforced() {
        let bl = Blacklist::default();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        bl.insert(ip, "abuse", Severity::High, Some(std::time::Duration::from_millis(0)), true);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bl.check(ip).is_none());
    }

    #[test]
    fn active_entry_is_enforced() {
        let bl = Blacklist::default();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        bl.insert(ip, "abuse", Severity::High, Some(std::time::Duration::from_secs(3600)), true);
        assert!(bl.check(ip).is_some());
    }
}
