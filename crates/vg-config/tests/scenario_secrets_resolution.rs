//! scenario_secrets_resolution
//!
//! Validates `resolve_secrets_with`:
//! 1. Every factor and the signing key resolve through their env var names.
//! 2. A missing factor variable fails closed, naming the variable and factor.
//! 3. Blank values count as missing.
//! 4. `Debug` on `ResolvedSecrets` is redacted.
//! 5. `resolve_secrets` against sentinel names that are never set fails closed.

use std::collections::HashMap;

use vg_config::load_layered_yaml_from_strings;
use vg_config::secrets::{resolve_secrets, resolve_secrets_with};

const YAML: &str = r#"
signing:
  key_env: "VG_TEST_SIGNING_KEY"
stages:
  - id: context-check
    factors:
      - id: ctx
        material_env: "VG_TEST_CTX"
  - id: admin-passwords
    factors:
      - id: pw-1
      - id: pw-2
"#;

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn cfg() -> serde_json::Value {
    load_layered_yaml_from_strings(&[YAML]).unwrap().config_json
}

#[test]
fn resolves_all_named_variables() {
    let vars = env(&[
        ("VG_TEST_SIGNING_KEY", "k-0123456789abcdef"),
        ("VG_TEST_CTX", "sha256$aa$bb"),
        ("VG_FACTOR_PW_1", "sha256$cc$dd"),
        ("VG_FACTOR_PW_2", "sha256$ee$ff"),
    ]);
    let s = resolve_secrets_with(&cfg(), |n| vars.get(n).cloned()).unwrap();
    assert_eq!(s.signing_key, "k-0123456789abcdef");
    assert_eq!(s.factor_material.len(), 3);
    assert_eq!(s.factor_material["pw-2"], "sha256$ee$ff");
}

#[test]
fn missing_factor_fails_closed_with_name_only() {
    let vars = env(&[
        ("VG_TEST_SIGNING_KEY", "k-0123456789abcdef"),
        ("VG_TEST_CTX", "sha256$aa$bb"),
        ("VG_FACTOR_PW_1", "sha256$cc$dd"),
    ]);
    let err = resolve_secrets_with(&cfg(), |n| vars.get(n).cloned())
        .expect_err("missing pw-2 material must fail")
        .to_string();
    assert!(err.contains("SECRETS_MISSING"), "got: {err}");
    assert!(err.contains("VG_FACTOR_PW_2"), "got: {err}");
    assert!(err.contains("pw-2"), "got: {err}");
    assert!(!err.contains("sha256$"), "values must not leak: {err}");
}

#[test]
fn blank_signing_key_counts_as_missing() {
    let vars = env(&[("VG_TEST_SIGNING_KEY", "   ")]);
    let err = resolve_secrets_with(&cfg(), |n| vars.get(n).cloned())
        .expect_err("blank key must fail")
        .to_string();
    assert!(err.contains("VG_TEST_SIGNING_KEY"), "got: {err}");
}

#[test]
fn debug_is_redacted() {
    let vars = env(&[
        ("VG_TEST_SIGNING_KEY", "super-secret-signing-key"),
        ("VG_TEST_CTX", "sha256$aa$bb"),
        ("VG_FACTOR_PW_1", "sha256$cc$dd"),
        ("VG_FACTOR_PW_2", "sha256$ee$ff"),
    ]);
    let s = resolve_secrets_with(&cfg(), |n| vars.get(n).cloned()).unwrap();
    let dbg = format!("{s:?}");
    assert!(dbg.contains("REDACTED"));
    assert!(dbg.contains("pw-1"), "factor ids are public: {dbg}");
    assert!(!dbg.contains("super-secret"), "{dbg}");
    assert!(!dbg.contains("sha256$"), "{dbg}");
}

#[test]
fn process_env_sentinels_fail_closed() {
    // Sentinel names that are never set in any environment.
    let yaml = r#"
signing:
  key_env: "VG_SENTINEL_NEVER_SET_SIGNING_7F3A"
stages:
  - id: s
    factors: [{id: a, material_env: "VG_SENTINEL_NEVER_SET_A_7F3A"}]
"#;
    let cfg = load_layered_yaml_from_strings(&[yaml]).unwrap().config_json;
    let err = resolve_secrets(&cfg).expect_err("sentinel must be unset").to_string();
    assert!(err.contains("VG_SENTINEL_NEVER_SET_SIGNING_7F3A"), "got: {err}");
}
