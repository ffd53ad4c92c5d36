//! Gateway config loader (strict parsing, env overrides applied post-parse).

pub mod schema;

use std::fs;

use pulsegate_core::error::{PulseError, Result};

pub use schema::{AuthSection, BreakerSection, BusSection, GatewayConfig, GatewaySection, SecuritySection};

pub fn load_from_file(path: &str) -> Result<GatewayConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| PulseError::Internal(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<GatewayConfig> {
    let mut cfg: GatewayConfig =
        serde_yaml::from_str(s).map_err(|e| PulseError::BadRequest(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    cfg.apply_env_overrides();
    Ok(cfg)
}

/// `hostname-pid-ts` fallback when `NODE_ID` is unset (spec §6).
pub fn derive_node_id() -> String {
    let host = hostname_best_effort();
    let pid = std::process::id();
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{host}-{pid}-{ts}")
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "node".into())
}
