#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use pulsegate_gateway::config;

#[test]
fn deny_unknown_fields_nested() {
    let bad = r#"
version: 1
gateway:
  host: "0.0.0.0"
  port: 8080
  listen: "0.0.0.0:8080"
"#;

    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.client_code().as_str(), "bad_request");
}

#[test]
fn ok_minimal_config() {
    let ok = "version: 1\n";
    let cfg = config::load_from_str(ok).expect("must parse");
    assert_eq!(cfg.version, 1);
    assert_eq!(cfg.gateway.port, 8080);
    assert_eq!(cfg.auth.max_concurrent_sessions, 5);
    assert!(!cfg.auth.allow_anonymous);
}

#[test]
fn rejects_unsupported_version() {
    let bad = "version: 2\n";
    let err = config::load_from_str(bad).expect_err("must fail");
    assert_eq!(err.client_code().as_str(), "unsupported_version");
}

#[test]
fn rate_limit_overrides_parse() {
    let ok = r#"
version: 1
rate_limits:
  message_send:
    limit: 5
    window_seconds: 10
"#;
    let cfg = config::load_from_str(ok).expect("must parse");
    let over = cfg.rate_limits.get("message_send").expect("override present");
    assert_eq!(over.limit, 5);
    assert_eq!(over.window_seconds, 10);
}
