//! Shared error type across PulseGate crates.
//!
//! `PulseError` is the single error taxonomy used from the transport layer
//! down to individual router handlers. Each variant maps to a stable
//! client-facing code and, where the error terminates a connection, a
//! WebSocket close code.

use thiserror::Error;

/// Client-facing error codes (stable API, sent in `error.code`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCode {
    BadRequest,
    AuthFailed,
    RateLimited,
    PayloadTooLarge,
    NotAllowed,
    UnsupportedVersion,
    ServiceUnavailable,
    Banned,
    Blacklisted,
    Internal,
}

impl ClientCode {
    /// String representation used in JSON responses.
    pub fn as_str(self) -> &'static str {
        match self {
            ClientCode::BadRequest => "bad_request",
            ClientCode::AuthFailed => "auth_failed",
            ClientCode::RateLimited => "rate_limited",
            ClientCode::PayloadTooLarge => "payload_too_large",
            ClientCode::NotAllowed => "not_allowed",
            ClientCode::UnsupportedVersion => "unsupported_version",
            ClientCode::ServiceUnavailable => "service_unavailable",
            ClientCode::Banned => "banned",
            ClientCode::Blacklisted => "blacklisted",
            ClientCode::Internal => "internal",
        }
    }
}

/// WebSocket close codes from the wire protocol (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    AuthFailure = 4001,
    RateLimited = 4008,
    Shutdown = 4009,
    SlowConsumer = 4010,
    HeartbeatTimeout = 4011,
    Banned = 4013,
    Blacklisted = 4014,
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, PulseError>;

/// Unified error type used across the gateway.
///
/// Variant grouping follows the error taxonomy kinds (not type names) from
/// the design: transient dependency failure, rate limiting, auth failure,
/// security rejection, validation, and unrecoverable local faults.
#[derive(Debug, Error)]
pub enum PulseError {
    /// A downstream dependency (bus, store, directory) is unavailable; retry
    /// governed by a circuit breaker.
    #[error("service unavailable: {0}")]
    Unavailable(&'static str),

    /// Caller exceeded a rate-limit budget.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Authentication failed for a documented reason.
    #[error("auth failed: {0}")]
    AuthFailed(AuthFailureReason),

    /// Connection rejected or torn down by the security layer.
    #[error("security rejection: {0}")]
    Security(SecurityReason),

    /// Malformed event schema or oversized payload; session stays open.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Not authorized to perform the requested action on this resource.
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// Unsupported protocol version in the handshake or frame header.
    #[error("unsupported protocol version")]
    UnsupportedVersion,

    /// Unrecoverable local invariant violation; the containing session is
    /// terminated but the server keeps running.
    #[error("internal: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureReason {
    InvalidFormat,
    TokenInvalid,
    UserUnknown,
    Banned,
    MaxConcurrentSessions,
    TwoFactorRequired,
}

impl std::fmt::Display for AuthFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthFailureReason::InvalidFormat => "invalid_format",
            AuthFailureReason::TokenInvalid => "token_invalid",
            AuthFailureReason::UserUnknown => "user_unknown",
            AuthFailureReason::Banned => "banned",
            AuthFailureReason::MaxConcurrentSessions => "max_concurrent_sessions",
            AuthFailureReason::TwoFactorRequired => "two_factor_required",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityReason {
    /// Carries the blacklist entry's own reason, so rejections (HTTP or WS
    /// close) can say why instead of just "blacklisted" (spec §4.4/§8
    /// scenario 5).
    Blacklisted(String),
    DdosDetected,
    HardBlocked,
}

impl std::fmt::Display for SecurityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityReason::Blacklisted(reason) => write!(f, "blacklisted: {reason}"),
            SecurityReason::DdosDetected => f.write_str("ddos_detected"),
            SecurityReason::HardBlocked => f.write_str("hard_blocked"),
        }
    }
}

impl PulseError {
    /// Map internal error to a stable client-facing code.
    pub fn client_code(&self) -> ClientCode {
        match self {
            PulseError::Unavailable(_) => ClientCode::ServiceUnavailable,
            PulseError::RateLimited { .. } => ClientCode::RateLimited,
            PulseError::AuthFailed(AuthFailureReason::Banned) => ClientCode::Banned,
            PulseError::AuthFailed(_) => ClientCode::AuthFailed,
            PulseError::Security(SecurityReason::Blacklisted(_)) => ClientCode::Blacklisted,
            PulseError::Security(_) => ClientCode::NotAllowed,
            PulseError::BadRequest(_) => ClientCode::BadRequest,
            PulseError::NotAllowed(_) => ClientCode::NotAllowed,
            PulseError::UnsupportedVersion => ClientCode::UnsupportedVersion,
            PulseError::Internal(_) => ClientCode::Internal,
        }
    }

    /// Close code to send if this error terminates the connection, `None` if
    /// the session should stay open (e.g. `Validation`).
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            PulseError::AuthFailed(AuthFailureReason::Banned) => Some(CloseCode::Banned),
            PulseError::AuthFailed(_) => Some(CloseCode::AuthFailure),
            PulseError::Security(SecurityReason::Blacklisted(_)) => Some(CloseCode::Blacklisted),
            PulseError::Security(_) => Some(CloseCode::Blacklisted),
            PulseError::RateLimited { .. } => None,
            _ => None,
        }
    }

    /// Whether this error should be retried server-side. Per spec §7,
    /// `RateLimited` and `AuthFailure` are never retried.
    pub fn retryable(&self) -> bool {
        matches!(self, PulseError::Unavailable(_))
    }
}
