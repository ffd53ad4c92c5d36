//! Config schema with strict parsing.
//!
//! `deny_unknown_fields` prevents silent misconfiguration; every tunable named
//! in the component design has a default here so a near-empty YAML file is a
//! valid config.

use serde::Deserialize;

use pulsegate_core::error::{PulseError, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub version: u32,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub rate_limits: std::collections::BTreeMap<String, RateLimitOverride>,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(PulseError::UnsupportedVersion);
        }
        Ok(())
    }

    /// Apply environment variable overrides (spec §6 Environment), applied
    /// after YAML parsing so env always wins.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NODE_ID") {
            self.gateway.node_id = Some(v);
        }
        if let Ok(v) = std::env::var("HOST") {
            self.gateway.host = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(p) = v.parse() {
                self.gateway.port = p;
            }
        }
        if let Ok(v) = std::env::var("BUS_URL") {
            self.bus.bus_url = Some(v);
        }
        if let Ok(v) = std::env::var("STORE_URL") {
            self.bus.store_url = Some(v);
        }
        if let Ok(v) = std::env::var("ALLOW_ANONYMOUS") {
            self.auth.allow_anonymous = v == "true";
        }
        if let Ok(v) = std::env::var("DDOS_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.security.ddos_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_CONCURRENT_SESSIONS") {
            if let Ok(n) = v.parse() {
                self.auth.max_concurrent_sessions = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_PAYLOAD_BYTES") {
            if let Ok(n) = v.parse() {
                self.security.max_payload_bytes = n;
            }
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_drain_deadline_ms")]
    pub drain_deadline_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            node_id: None,
            host: default_host(),
            port: default_port(),
            ping_interval_ms: default_ping_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            drain_deadline_ms: default_drain_deadline_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_ping_interval_ms() -> u64 {
    25_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}
fn default_drain_deadline_ms() -> u64 {
    20_000
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecuritySection {
    #[serde(default = "default_ddos_threshold")]
    pub ddos_threshold: u32,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    #[serde(default)]
    pub blocked_countries: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            ddos_threshold: default_ddos_threshold(),
            max_payload_bytes: default_max_payload_bytes(),
            allowed_countries: Vec::new(),
            blocked_countries: Vec::new(),
        }
    }
}

fn default_ddos_threshold() -> u32 {
    100
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            allow_anonymous: false,
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

fn default_max_concurrent_sessions() -> usize {
    5
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSection {
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_breaker_probe_successes")]
    pub probe_successes_required: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            cooldown_ms: default_breaker_cooldown_ms(),
            probe_successes_required: default_breaker_probe_successes(),
        }
    }
}

fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_ms() -> u64 {
    30_000
}
fn default_breaker_probe_successes() -> u32 {
    3
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BusSection {
    #[serde(default)]
    pub bus_url: Option<String>,
    #[serde(default)]
    pub store_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitOverride {
    pub limit: u32,
    pub window_seconds: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: GatewayConfig = serde_yaml::from_str("version: 1\n").expect("must parse");
        assert_eq!(cfg.gateway.port, 8080);
        assert_eq!(cfg.security.ddos_threshold, 100);
        assert_eq!(cfg.auth.max_concurrent_sessions, 5);
    }

    #[test]
    fn unknown_field_rejected() {
        let bad = "version: 1\ngateway:\n  listen: \"0.0.0.0:8080\"\n";
        let err = serde_yaml::from_str::<GatewayConfig>(bad);
        assert!(err.is_err());
    }
}
