//! Scenario: daemon boot helpers turn config + secrets into a working gate.
//!
//! # Invariants under test
//!
//! 1. `gate_parts_from_config` accepts the fixture config and env secrets.
//! 2. `audit.path` selects a hash-chained JSONL sink; absent, the database
//!    sink is used; with neither, boot fails instead of keeping entries in
//!    an unbounded in-memory log.
//! 3. `daemon.sweep_interval_secs` defaults to 60s and rejects zero.
//! 4. A booted state carries its config hash into `/v1/health`.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;
use vg_audit::{verify_hash_chain, AuditSink, MemoryAuditLog, VerifyResult};
use vg_config::{load_layered_yaml_from_strings, report_unused_keys, ConfigSurface, UnusedKeyPolicy};
use vg_config::secrets::resolve_secrets_with;
use vg_daemon::{routes, state};
use vg_gate::{MemoryStore, SubjectId, SystemClock};
use vg_testkit::{vault_config_yaml, vault_env};

#[tokio::test]
async fn boots_gate_with_jsonl_audit() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let overlay = format!(
        "audit:\n  path: {}\ndaemon:\n  sweep_interval_secs: 5\n",
        audit_path.display()
    );
    let base = vault_config_yaml();
    let loaded = load_layered_yaml_from_strings(&[&base, &overlay]).unwrap();

    let report =
        report_unused_keys(ConfigSurface::Daemon, &loaded.config_json, UnusedKeyPolicy::Fail).unwrap();
    assert!(report.is_clean());

    let env = vault_env();
    let secrets = resolve_secrets_with(&loaded.config_json, |k| env.get(k).cloned()).unwrap();
    let parts = state::gate_parts_from_config(&loaded.config_json, &secrets).unwrap();
    let audit = state::audit_sink_from_config(&loaded.config_json, None).unwrap();
    assert_eq!(
        state::sweep_interval_from_config(&loaded.config_json).unwrap(),
        Duration::from_secs(5)
    );

    let st = Arc::new(
        state::AppState::new(
            parts,
            state::DaemonStore::Memory(MemoryStore::new()),
            audit,
            Arc::new(SystemClock::new()),
        )
        .with_config_hash(loaded.config_hash.clone()),
    );
    let s = st
        .gate
        .create_session(SubjectId::new("vault-admin"), json!({}))
        .await
        .unwrap();
    st.gate.abort(s.session_id).await.unwrap();

    assert_eq!(
        verify_hash_chain(&audit_path).unwrap(),
        VerifyResult::Valid { lines: 2 }
    );

    let resp = routes::build_router(Arc::clone(&st))
        .oneshot(
            Request::builder()
                .uri("/v1/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["config_hash"], loaded.config_hash.as_str());
}

#[test]
fn audit_falls_back_and_interval_defaults() {
    let cfg = json!({});
    let fallback: Arc<dyn AuditSink> = Arc::new(MemoryAuditLog::new());
    let chosen = state::audit_sink_from_config(&cfg, Some(Arc::clone(&fallback))).unwrap();
    assert!(Arc::ptr_eq(&chosen, &fallback));

    assert_eq!(
        state::sweep_interval_from_config(&cfg).unwrap(),
        state::DEFAULT_SWEEP_INTERVAL
    );
    assert!(state::sweep_interval_from_config(&json!({"daemon": {"sweep_interval_secs": 0}})).is_err());
    assert!(state::audit_sink_from_config(
        &json!({"audit": {"path": "/tmp/x.jsonl", "hash_chain": "yes"}}),
        Some(fallback)
    )
    .is_err());
}

#[test]
fn boot_without_audit_destination_fails() {
    let Err(err) = state::audit_sink_from_config(&json!({"audit": {"hash_chain": true}}), None) else {
        panic!("no audit path and no database must not boot");
    };
    let msg = format!("{err:#}");
    assert!(msg.contains("AUDIT_DESTINATION_REQUIRED"), "{msg}");
}

#[test]
fn short_signing_key_fails_boot() {
    let base = vault_config_yaml();
    let loaded = load_layered_yaml_from_strings(&[&base]).unwrap();
    let mut env = vault_env();
    env.insert(vg_testkit::SIGNING_KEY_ENV.to_string(), "short".to_string());
    let secrets = resolve_secrets_with(&loaded.config_json, |k| env.get(k).cloned()).unwrap();

    let err = state::gate_parts_from_config(&loaded.config_json, &secrets).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("at least 16 bytes"), "{msg}");
    assert!(!msg.contains("short"));
}
