#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use ctxbridge_core::error::BridgeError;
use ctxbridge_core::protocol::WireFormat;
use ctxbridge_runtime::config;

#[test]
fn deny_unknown_fields_nested() {
    let bad = r#"
version: 1
services:
  - name: "contacts-service"
    max_client: 4 # typo should fail
"#;

    let err = config::load_from_str(bad).expect_err("must fail");
    assert!(matches!(err, BridgeError::Config(_)));
}

#[test]
fn ok_minimal_config() {
    let cfg = config::load_from_str("version: 1\n").expect("must parse");
    assert_eq!(cfg.version, 1);
    assert_eq!(cfg.transport.wire_format, WireFormat::Text);
    assert_eq!(cfg.client.connect_timeout_ms, 5000);
    assert_eq!(cfg.max_clients_for("anything"), 1024);
}

#[test]
fn per_service_limits_override_default() {
    let ok = r#"
version: 1
transport:
  wire_format: structured
runtime:
  default_max_clients: 16
services:
  - name: "mobile-connections"
    max_clients: 2
"#;
    let cfg = config::load_from_str(ok).expect("must parse");
    assert_eq!(cfg.transport.wire_format, WireFormat::Structured);
    assert_eq!(cfg.max_clients_for("mobile-connections"), 2);
    assert_eq!(cfg.max_clients_for("contacts-service"), 16);
}

#[test]
fn rejects_bad_values() {
    let wrong_version = config::load_from_str("version: 2\n").expect_err("must fail");
    assert_eq!(wrong_version, BridgeError::UnsupportedVersion);

    let zero = "version: 1\nservices:\n  - name: svc\n    max_clients: 0\n";
    assert!(config::load_from_str(zero).is_err());

    let dup = "version: 1\nservices:\n  - {name: svc, max_clients: 1}\n  - {name: svc, max_clients: 2}\n";
    assert!(config::load_from_str(dup).is_err());

    let timeout = "version: 1\nclient:\n  connect_timeout_ms: 5\n";
    assert!(config::load_from_str(timeout).is_err());
}

#[test]
fn sample_config_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../ctxbridge.yaml");
    let cfg = config::load_from_file(path).expect("sample config must load");
    assert_eq!(cfg.max_clients_for("echo"), 8);
    assert_eq!(cfg.max_clients_for("other"), 1024);
}
