//! Cluster-local registry of active sessions, keyed by session id and by
//! owning user (spec §3 "Ownership: Session is owned by one node").

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use pulsegate_core::error::CloseCode;

use crate::auth::SessionCounter;
use crate::security::SessionCloser;
use crate::session::Session;

#[derive(Default)]
pub struct SessionRegistry {
    by_id: DashMap<String, Arc<Session>>,
    by_user: DashMap<String, DashSet<String>>,
    by_ip: DashMap<String, DashSet<String>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Arc<Session>) {
        self.by_ip.entry(session.remote_addr.clone()).or_default().insert(session.session_id.clone());
        self.by_id.insert(session.session_id.clone(), session);
    }

    pub fn attach_user(&self, user_id: &str, session_id: &str) {
        self.by_user.entry(user_id.to_string()).or_default().insert(session_id.to_string());
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.by_id.get(session_id).map(|e| e.clone())
    }

    /// Remove a session entirely. Returns `true` if the owning user has no
    /// remaining sessions anywhere on this node (callers still need a
    /// cluster-wide confirmation via the shared store before declaring the
    /// user offline, per spec §4.6).
    pub fn remove(&self, session_id: &str, user_id: Option<&str>) -> bool {
        if let Some((_, session)) = self.by_id.remove(session_id) {
            if let Some(set) = self.by_ip.get(&session.remote_addr) {
                set.remove(session_id);
                let empty = set.is_empty();
                drop(set);
                if empty {
                    self.by_ip.remove(&session.remote_addr);
                }
            }
        }
        if let Some(user_id) = user_id {
            if let Some(set) = self.by_user.get(user_id) {
                set.remove(session_id);
                let empty = set.is_empty();
                drop(set);
                if empty {
                    self.by_user.remove(user_id);
                }
                return empty;
            }
        }
        true
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<Arc<Session>> {
        match self.by_user.get(user_id) {
            Some(set) => set.iter().filter_map(|id| self.get(&id)).collect(),
            None => Vec::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.by_id.len()
    }
}

impl SessionCounter for SessionRegistry {
    fn count_for_user(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SessionCloser for SessionRegistry {
    async fn close_all_for_ip(&self, ip: IpAddr, code: CloseCode) -> usize {
        let Some(ids) = self.by_ip.get(&ip.to_string()).map(|set| set.iter().map(|id| id.clone()).collect::<Vec<_>>()) else {
            return 0;
        };
        let mut closed = 0;
        for id in ids {
            if let Some(session) = self.get(&id) {
                session.request_close(code).await;
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn tracks_per_user_session_count() {
        let registry = SessionRegistry::default();
        let s1 = Arc::new(Session::new("s1".into(), "n1".into(), "ip".into(), "ua".into()));
        let s2 = Arc::new(Session::new("s2".into(), "n1".into(), "ip".into(), "ua".into()));
        registry.insert(s1);
        registry.insert(s2);
        registry.attach_user("u1", "s1");
        registry.attach_user("u1", "s2");
        assert_eq!(registry.count_for_user("u1"), 2);

        let last = registry.remove("s1", Some("u1"));
        assert!(!last);
        let last2 = registry.remove("s2", Some("u1"));
        assert!(last2);
    }

    #[tokio::test]
    async fn close_all_for_ip_requests_close_on_every_session_from_that_ip() {
        let registry = SessionRegistry::default();
        let s1 = Arc::new(Session::new("s1".into(), "n1".into(), "1.2.3.4".into(), "ua".into()));
        let s2 = Arc::new(Session::new("s2".into(), "n1".into(), "1.2.3.4".into(), "ua".into()));
        let s3 = Arc::new(Session::new("s3".into(), "n1".into(), "5.6.7.8".into(), "ua".into()));
        registry.insert(s1.clone());
        registry.insert(s2.clone());
        registry.insert(s3.clone());

        let closed = registry.close_all_for_ip("1.2.3.4".parse().unwrap(), CloseCode::Blacklisted).await;
        assert_eq!(closed, 2);
        assert_eq!(s1.take_requested_close().await, Some(CloseCode::Blacklisted));
        assert_eq!(s2.take_requested_close().await, Some(CloseCode::Blacklisted));
        assert_eq!(s3.take_requested_close().await, None);
    }
}
