//! Per-event content validation, invoked by Router (spec §4.4).

use pulsegate_core::error::{PulseError, Result};

const EVENT_NAME_DENYLIST: &[&str] = &["__proto__", "constructor", "eval", "script", "prototype"];

const INJECTION_PATTERNS: &[&str] = &["<script", "javascript:", "onerror=", "onload=", "data:text/html"];

const PRIVILEGE_KEYWORDS: &[&str] = &["isadmin", "is_admin", "role=admin", "sudo", "grant_role"];

pub struct ContentValidator {
    max_payload_bytes: usize,
}

pub struct ValidationOutcome {
    /// Set when the event content should raise the caller's suspicion score
    /// without being rejected outright (privilege-escalation heuristic).
    pub raise_suspicion: bool,
}

impl ContentValidator {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    pub fn validate_event_name(&self, event: &str) -> Result<()> {
        let lower = event.to_ascii_lowercase();
        if EVENT_NAME_DENYLIST.iter().any(|bad| lower.contains(bad)) {
            return Err(PulseError::BadRequest(format!("disallowed event name: {event}")));
        }
        Ok(())
    }

    pub fn validate_payload(&self, raw: &str) -> Result<ValidationOutcome> {
        if raw.len() > self.max_payload_bytes {
            return Err(PulseError::BadRequest("payload too large".into()));
        }

        let lower = raw.to_ascii_lowercase();
        if INJECTION_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Err(PulseError::BadRequest("payload contains disallowed content".into()));
        }

        let raise_suspicion = PRIVILEGE_KEYWORDS.iter().any(|p| lower.contains(p));
        Ok(ValidationOutcome { raise_suspicion })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn rejects_denylisted_event_name() {
        let v = ContentValidator::new(1024);
        assert!(v.validate_event_name("__proto__").is_err());
        assert!(v.validate_event_name("message.send").is_ok());
    }

    #[test]
    fn rejects_oversized_payload() {
        let v = ContentValidator::new(8);
        assert!(v.validate_payload("this is way too long").is_err());
    }

    #[test]
    fn rejects_script_injection() {
        let v = ContentValidator::new(4096);
        assert!(v.validate_payload(r#"{"content":"<script>alert(1)</script>"}"#).is_err());
    }

    #[test]
    fn privilege_keyword_raises_suspicion_without_blocking() {
        let v = ContentValidator::new(4096);
        let outcome = v.validate_payload(r#"{"content":"please grant_role admin"}"#).expect("allowed");
        assert!(outcome.raise_suspicion);
    }
}
