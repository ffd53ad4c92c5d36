//! Pre-connect filter chain and runtime suspicion scoring (spec §4.4).
//!
//! Generalizes `transport::handshake::HandshakeDefender`'s per-IP leaky
//! bucket into the full ordered check list: blacklist, connection rate
//! limit, geo/UA filters, DDoS detection, suspicion score.

pub mod blacklist;
pub mod ddos;
pub mod suspicion;
pub mod validation;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use pulsegate_core::error::{CloseCode, PulseError, Result, SecurityReason};
use pulsegate_core::model::Severity;

use crate::ratelimit::{Action, SlidingWindowLimiter};
use blacklist::Blacklist;
use ddos::DdosDetector;
use suspicion::{Crossing, SuspicionTracker};
pub use validation::ContentValidator;

/// Closes every session from a given IP; implemented by
/// `session::registry::SessionRegistry`. Kept as a trait here to avoid a
/// dependency cycle between `security` and `session`.
#[async_trait]
pub trait SessionCloser: Send + Sync {
    async fn close_all_for_ip(&self, ip: IpAddr, code: CloseCode) -> usize;
}

pub struct GeoFilter {
    allowed_countries: Vec<String>,
    blocked_countries: Vec<String>,
}

impl GeoFilter {
    pub fn new(allowed: Vec<String>, blocked: Vec<String>) -> Self {
        Self { allowed_countries: allowed, blocked_countries: blocked }
    }

    /// `country` is resolved upstream (out of scope here); `None` always
    /// passes when no lists are configured.
    pub fn allow(&self, country: Option<&str>) -> bool {
        match country {
            Some(c) if self.blocked_countries.iter().any(|b| b == c) => false,
            Some(c) if !self.allowed_countries.is_empty() => self.allowed_countries.iter().any(|a| a == c),
            _ => true,
        }
    }
}

pub struct Security {
    blacklist: Blacklist,
    ddos: DdosDetector,
    suspicion: SuspicionTracker,
    geo: GeoFilter,
    pub content: ContentValidator,
    connect_limiter: std::sync::Arc<SlidingWindowLimiter>,
    sessions: Arc<dyn SessionCloser>,
}

impl Security {
    pub fn new(
        ddos_threshold: u32,
        max_payload_bytes: usize,
        allowed_countries: Vec<String>,
        blocked_countries: Vec<String>,
        connect_limiter: std::sync::Arc<SlidingWindowLimiter>,
        sessions: Arc<dyn SessionCloser>,
    ) -> Self {
        Self {
            blacklist: Blacklist::default(),
            ddos: DdosDetector::new(ddos_threshold),
            suspicion: SuspicionTracker::default(),
            geo: GeoFilter::new(allowed_countries, blocked_countries),
            content: ContentValidator::new(max_payload_bytes),
            connect_limiter,
            sessions,
        }
    }

    /// Ordered pre-connect checks (spec §4.4). Returns `Ok(())` to admit the
    /// connection attempt.
    pub async fn allow_connect(&self, addr: IpAddr, country: Option<&str>) -> Result<()> {
        if let Some(entry) = self.blacklist.check(addr) {
            return Err(PulseError::Security(SecurityReason::Blacklisted(entry.reason)));
        }

        self.connect_limiter.admit_or_err(Action::Connect, &addr.to_string()).await?;

        if !self.geo.allow(country) {
            return Err(PulseError::Security(SecurityReason::HardBlocked));
        }

        if self.ddos.record_connect(addr).await {
            self.blacklist.insert(addr, "ddos_detected", Severity::High, Some(ddos::DDOS_BLOCK_DURATION), true);
            tracing::warn!(%addr, "ddos_detected");
            return Err(PulseError::Security(SecurityReason::DdosDetected));
        }

        match self.suspicion.score(addr).await {
            s if s >= suspicion::HARD_BLOCK_THRESHOLD => {
                self.blacklist.insert(addr, "suspicion_hard_block", Severity::Critical, None, true);
                Err(PulseError::Security(SecurityReason::HardBlocked))
            }
            _ => Ok(()),
        }
    }

    /// Apply a suspicion delta for `addr`, blacklisting and closing every
    /// live session from it when thresholds are hit (spec §4.4 "hard block
    /// closes all sessions from that IP").
    pub async fn raise_suspicion(&self, addr: IpAddr, delta: u32) -> Crossing {
        let crossing = self.suspicion.add(addr, delta).await;
        match crossing {
            Crossing::HardBlock => {
                self.blacklist.insert(addr, "suspicion_hard_block", Severity::Critical, None, true);
                let closed = self.sessions.close_all_for_ip(addr, CloseCode::Blacklisted).await;
                tracing::warn!(%addr, closed, "security.hard_block");
            }
            Crossing::Alert => {
                tracing::info!(%addr, "security.suspicious");
            }
            Crossing::None => {}
        }
        crossing
    }

    pub fn validate_content(&self, event: &str, raw_payload: &str) -> Result<validation::ValidationOutcome> {
        self.content.validate_event_name(event)?;
        self.content.validate_payload(raw_payload)
    }

    pub async fn gc(&self) {
        self.blacklist.gc();
        self.suspicion.decay_all().await;
    }

    pub const EVENTS_PER_SECOND_PENALTY: u32 = suspicion::HIGH_EVENT_RATE_PENALTY;
    pub const PRIVILEGE_ESCALATION_PENALTY: u32 = suspicion::PRIVILEGE_ESCALATION_PENALTY;
    pub const UNKNOWN_EVENT_PENALTY: u32 = suspicion::UNKNOWN_EVENT_PENALTY;
}
