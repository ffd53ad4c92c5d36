//! Authentication gate: token extraction, validation, user lookup,
//! concurrent-session cap (spec §4.5).
//!
//! `TokenVerifier`/`UserDirectory` calls are wrapped in the `auth` circuit
//! breaker, the same wrapping style `AppState::resolve_ticket` used for its
//! stub ticket resolver, generalized to real contracts.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use pulsegate_core::contracts::{TokenVerifier, UserDirectory};
use pulsegate_core::error::{AuthFailureReason, PulseError, Result};
use pulsegate_core::model::User;

use crate::breaker::BreakerRegistry;
use crate::ratelimit::{Action, SlidingWindowLimiter};

pub const MAX_CONCURRENT_SESSIONS: usize = 5;
pub const BANNED_GRACE: std::time::Duration = std::time::Duration::from_secs(30 * 24 * 3600);
pub const REFRESH_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Raw handshake fields, already extracted from headers/query/body by the
/// transport layer. Priority order for the token itself is fixed at
/// `auth.token` > `Authorization: Bearer` > `?token=` > alternative keys
/// (spec §4.5/§6).
#[derive(Debug, Default, Clone)]
pub struct Handshake {
    pub auth_token: Option<String>,
    pub authorization_header: Option<String>,
    pub query_token: Option<String>,
    pub alt_token: Option<String>,
    pub two_factor_code: Option<String>,
}

impl Handshake {
    pub fn extract_token(&self) -> Option<&str> {
        if let Some(t) = &self.auth_token {
            return Some(t);
        }
        if let Some(h) = &self.authorization_header {
            if let Some(t) = h.strip_prefix("Bearer ") {
                return Some(t);
            }
        }
        if let Some(t) = &self.query_token {
            return Some(t);
        }
        self.alt_token.as_deref()
    }
}

/// Counts a user's currently active sessions cluster-wide; implemented by
/// `session::registry::SessionRegistry`. Kept as a trait here to avoid a
/// dependency cycle between `auth` and `session`.
pub trait SessionCounter: Send + Sync {
    fn count_for_user(&self, user_id: &str) -> usize;
}

pub struct AuthOutcome {
    pub user: User,
    pub stale_token: bool,
}

pub struct AuthGate {
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn UserDirectory>,
    breakers: Arc<BreakerRegistry>,
    rate_limiter: Arc<SlidingWindowLimiter>,
    sessions: Arc<dyn SessionCounter>,
    allow_anonymous: bool,
    max_concurrent_sessions: usize,
}

impl AuthGate {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        directory: Arc<dyn UserDirectory>,
        breakers: Arc<BreakerRegistry>,
        rate_limiter: Arc<SlidingWindowLimiter>,
        sessions: Arc<dyn SessionCounter>,
        allow_anonymous: bool,
        max_concurrent_sessions: usize,
    ) -> Self {
        Self {
            verifier,
            directory,
            breakers,
            rate_limiter,
            sessions,
            allow_anonymous,
            max_concurrent_sessions,
        }
    }

    pub async fn authenticate(&self, handshake: &Handshake, remote_ip: &str) -> Result<AuthOutcome> {
        self.rate_limiter.admit_or_err(Action::AuthAttempt, remote_ip).await?;

        if self.allow_anonymous && handshake.extract_token().is_none() {
            return Ok(AuthOutcome {
                user: User {
                    user_id: format!("anon-{remote_ip}"),
                    display_name: "anonymous".into(),
                    is_banned_until: None,
                    roles: Default::default(),
                    two_factor_required: false,
                },
                stale_token: false,
            });
        }

        let token = handshake
            .extract_token()
            .ok_or(PulseError::AuthFailed(AuthFailureReason::InvalidFormat))?;

        if token.len() < 10 || token.matches('.').count() != 2 {
            return Err(PulseError::AuthFailed(AuthFailureReason::InvalidFormat));
        }

        let auth_breaker = self.breakers.get("auth");
        let verifier = self.verifier.clone();
        let token_owned = token.to_string();
        let verified = auth_breaker
            .call(|| async move { verifier.verify(&token_owned).await })
            .await
            .map_err(|_| PulseError::AuthFailed(AuthFailureReason::TokenInvalid))?;

        let directory = self.directory.clone();
        let user_id = verified.user_id.clone();
        let user = auth_breaker
            .call(|| async move { directory.lookup_user(&user_id).await })
            .await
            .map_err(|_| PulseError::AuthFailed(AuthFailureReason::UserUnknown))?
            .ok_or(PulseError::AuthFailed(AuthFailureReason::UserUnknown))?;

        let now = now_unix_s();
        if let Some(banned_until) = user.is_banned_until {
            if banned_until > now.saturating_sub(BANNED_GRACE.as_secs()) {
                return Err(PulseError::AuthFailed(AuthFailureReason::Banned));
            }
        }

        if self.sessions.count_for_user(&user.user_id) >= self.max_concurrent_sessions {
            return Err(PulseError::AuthFailed(AuthFailureReason::MaxConcurrentSessions));
        }

        if user.two_factor_required && handshake.two_factor_code.is_none() {
            return Err(PulseError::AuthFailed(AuthFailureReason::TwoFactorRequired));
        }

        let stale_token = now.saturating_sub(verified.issued_at_unix_s) >= REFRESH_THRESHOLD.as_secs();
        if stale_token {
            tracing::info!(user_id = %user.user_id, "security.old_token");
        }

        Ok(AuthOutcome { user, stale_token })
    }
}

fn now_unix_s() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pulsegate_core::contracts::VerifiedToken;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedVerifier;
    #[async_trait]
    impl TokenVerifier for FixedVerifier {
        async fn verify(&self, _token: &str) -> Result<VerifiedToken> {
            Ok(VerifiedToken { user_id: "u1".into(), issued_at_unix_s: now_unix_s() })
        }
    }

    struct FixedDirectory {
        banned: bool,
        two_factor: bool,
    }
    #[async_trait]
    impl UserDirectory for FixedDirectory {
        async fn lookup_user(&self, user_id: &str) -> Result<Option<User>> {
            Ok(Some(User {
                user_id: user_id.into(),
                display_name: "A".into(),
                is_banned_until: if self.banned { Some(now_unix_s()) } else { None },
                roles: Default::default(),
                two_factor_required: self.two_factor,
            }))
        }
        async fn friends(&self, _user_id: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    struct FixedCounter(AtomicUsize);
    impl SessionCounter for FixedCounter {
        fn count_for_user(&self, _user_id: &str) -> usize {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn gate(directory: FixedDirectory, sessions: usize) -> AuthGate {
        AuthGate::new(
            Arc::new(FixedVerifier),
            Arc::new(directory),
            Arc::new(BreakerRegistry::default()),
            Arc::new(SlidingWindowLimiter::new(Default::default())),
            Arc::new(FixedCounter(AtomicUsize::new(sessions))),
            false,
            MAX_CONCURRENT_SESSIONS,
        )
    }

    #[tokio::test]
    async fn happy_path_authenticates() {
        let gate = gate(FixedDirectory { banned: false, two_factor: false }, 0);
        let hs = Handshake { auth_token: Some("H.P.S".into()), ..Default::default() };
        let outcome = gate.authenticate(&hs, "1.2.3.4").await.expect("auth ok");
        assert_eq!(outcome.user.user_id, "u1");
    }

    #[tokio::test]
    async fn concurrent_session_cap_enforced() {
        let gate = gate(FixedDirectory { banned: false, two_factor: false }, MAX_CONCURRENT_SESSIONS);
        let hs = Handshake { auth_token: Some("H.P.S".into()), ..Default::default() };
        let err = gate.authenticate(&hs, "1.2.3.4").await.unwrap_err();
        assert!(matches!(err, PulseError::AuthFailed(AuthFailureReason::MaxConcurrentSessions)));
    }

    #[tokio::test]
    async fn banned_user_rejected() {
        let gate = gate(FixedDirectory { banned: true, two_factor: false }, 0);
        let hs = Handshake { auth_token: Some("H.P.S".into()), ..Default::default() };
        let err = gate.authenticate(&hs, "1.2.3.4").await.unwrap_err();
        assert!(matches!(err, PulseError::AuthFailed(AuthFailureReason::Banned)));
    }

    #[tokio::test]
    async fn two_factor_required_without_code_rejected() {
        let gate = gate(FixedDirectory { banned: false, two_factor: true }, 0);
        let hs = Handshake { auth_token: Some("H.P.S".into()), ..Default::default() };
        let err = gate.authenticate(&hs, "1.2.3.4").await.unwrap_err();
        assert!(matches!(err, PulseError::AuthFailed(AuthFailureReason::TwoFactorRequired)));
    }

    #[test]
    fn extraction_priority_order() {
        let hs = Handshake {
            auth_token: Some("from_auth".into()),
            authorization_header: Some("Bearer from_header".into()),
            query_token: Some("from_query".into()),
            alt_token: Some("from_alt".into()),
            two_factor_code: None,
        };
        assert_eq!(hs.extract_token(), Some("from_auth"));

        let hs2 = Handshake { authorization_header: Some("Bearer from_header".into()), query_token: Some("from_query".into()), ..Default::default() };
        assert_eq!(hs2.extract_token(), Some("from_header"));
    }
}
