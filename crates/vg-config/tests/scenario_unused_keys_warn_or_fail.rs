//! scenario_unused_keys_warn_or_fail
//!
//! Validates:
//! 1) Unused keys are reported under Warn without error.
//! 2) Unused keys fail under Fail.
//! 3) Keys under consumed prefixes (including whole `stages` subtree) are not flagged.
//! 4) The daemon surface consumes audit/daemon keys the gate surface does not.

use vg_config::{load_layered_yaml_from_strings, report_unused_keys, ConfigSurface, UnusedKeyPolicy};

const YAML: &str = r#"
gate:
  session_ttl_secs: 600
  grant_scope: ["vault:admin"]
stages:
  - id: context-check
    threshold: 1
    factors:
      - id: ctx
        normalize: exact
audit:
  path: "audit/gate.jsonl"
  hash_chain: true
legacy:
  ip_whitelist: "10.0.0.1"
"#;

#[test]
fn warn_reports_unused_without_error() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let report = report_unused_keys(ConfigSurface::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn never errors");
    assert_eq!(report.unused_leaf_pointers, vec!["/legacy/ip_whitelist".to_string()]);
    assert!(!report.is_clean());
}

#[test]
fn fail_errors_with_deterministic_message() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let err = report_unused_keys(ConfigSurface::Daemon, &loaded.config_json, UnusedKeyPolicy::Fail)
        .expect_err("fail must error")
        .to_string();
    assert!(err.contains("CONFIG_UNUSED_KEYS"), "got: {err}");
    assert!(err.contains("surface=DAEMON"), "got: {err}");
    assert!(err.contains("/legacy/ip_whitelist"), "got: {err}");
}

#[test]
fn gate_surface_does_not_consume_audit_keys() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let report = report_unused_keys(ConfigSurface::Gate, &loaded.config_json, UnusedKeyPolicy::Warn).unwrap();
    assert_eq!(
        report.unused_leaf_pointers,
        vec![
            "/audit/hash_chain".to_string(),
            "/audit/path".to_string(),
            "/legacy/ip_whitelist".to_string(),
        ]
    );
}

#[test]
fn clean_config_passes_fail_policy() {
    let yaml = r#"
lockout:
  failure_threshold: 3
stages:
  - id: s
    factors: [{id: a}]
"#;
    let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();
    let report = report_unused_keys(ConfigSurface::Gate, &loaded.config_json, UnusedKeyPolicy::Fail).unwrap();
    assert!(report.is_clean());
    assert!(report.consumed_prefixes.contains(&"/stages".to_string()));
}
