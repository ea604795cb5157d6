//! Deterministic fixtures for gate scenario tests.
//!
//! The fixture vault has three stages:
//!
//! | order | stage              | factors                 | threshold | normalization |
//! |-------|--------------------|-------------------------|-----------|---------------|
//! | 0     | `context-check`    | `ctx`                   | 1 of 1    | exact         |
//! | 1     | `recovery-phrases` | `phrase-1..4`           | 4 of 4    | phrase        |
//! | 2     | `admin-passwords`  | `password-1..4`         | 4 of 4    | exact         |
//!
//! Material uses fixed salts so every run hashes identically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use vg_audit::MemoryAuditLog;
use vg_gate::{
    hash_secret_with_salt, AccessTokenIssuer, CredentialVerifier, FactorId, GateController,
    GateParts, GateResult, GateSession, GrantSigner, LockoutPolicy, MemoryStore, Normalization,
    Outcome, SessionId, SessionStore, Stage, StageRegistry, StaticSecretStore, SubjectId,
};

pub use vg_gate::ManualClock;

pub const SIGNING_KEY: &str = "vg-testkit-signing-key-0123456789";
pub const SIGNING_KEY_ENV: &str = "VG_TEST_SIGNING_KEY";
pub const SUBJECT: &str = "vault-admin";

pub const CONTEXT_FACTOR: &str = "ctx";
pub const CONTEXT_SECRET: &str = "origin:127.0.0.1";

pub const PHRASE_FACTORS: [&str; 4] = ["phrase-1", "phrase-2", "phrase-3", "phrase-4"];
pub const PHRASES: [&str; 4] = [
    "quantum vault guardian",
    "harmony matrix shield",
    "eternal sovereign key",
    "cosmic defense protocol",
];

pub const PASSWORD_FACTORS: [&str; 4] = ["password-1", "password-2", "password-3", "password-4"];
pub const PASSWORDS: [&str; 4] = [
    "Vault#Admin-01!",
    "Sovereign$Key-02",
    "Guardian%Lock-03",
    "Harmony&Gate-04",
];

pub const SESSION_TTL: Duration = Duration::from_secs(600);
pub const GRANT_TTL: Duration = Duration::from_secs(300);
pub const GRANT_SCOPE: &str = "vault:admin";

/// Fixed start instant for manual clocks.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 30, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn vault_stages() -> Vec<Stage> {
    vec![
        Stage::new("context-check", 0, [CONTEXT_FACTOR], 1),
        Stage::new("recovery-phrases", 1, PHRASE_FACTORS, 4).with_normalization(Normalization::Phrase),
        Stage::new("admin-passwords", 2, PASSWORD_FACTORS, 4),
    ]
}

pub fn vault_registry() -> StageRegistry {
    match StageRegistry::new(vault_stages()) {
        Ok(r) => r,
        Err(e) => panic!("fixture registry invalid: {e}"),
    }
}

/// The correct secret for a fixture factor.
pub fn secret_for(factor: &str) -> Option<&'static str> {
    if factor == CONTEXT_FACTOR {
        return Some(CONTEXT_SECRET);
    }
    PHRASE_FACTORS
        .iter()
        .zip(PHRASES)
        .chain(PASSWORD_FACTORS.iter().zip(PASSWORDS))
        .find(|(f, _)| **f == factor)
        .map(|(_, s)| s)
}

fn normalization_for(factor: &str) -> Normalization {
    if PHRASE_FACTORS.contains(&factor) {
        Normalization::Phrase
    } else {
        Normalization::Exact
    }
}

/// Deterministic material for a fixture factor.
pub fn material_for(factor: &str) -> String {
    let salt = Sha256::digest(format!("vg-testkit-salt:{factor}").as_bytes());
    let secret = secret_for(factor).unwrap_or_default();
    hash_secret_with_salt(secret, normalization_for(factor), &salt[..16])
}

fn all_factors() -> impl Iterator<Item = &'static str> {
    std::iter::once(CONTEXT_FACTOR)
        .chain(PHRASE_FACTORS)
        .chain(PASSWORD_FACTORS)
}

pub fn vault_secrets() -> StaticSecretStore {
    all_factors()
        .map(|f| (FactorId::new(f), material_for(f)))
        .collect()
}

pub fn vault_parts(lockout: LockoutPolicy) -> GateParts {
    let registry = vault_registry();
    let verifier = match CredentialVerifier::preload(&registry, &vault_secrets(), None) {
        Ok(v) => v,
        Err(e) => panic!("fixture material invalid: {e}"),
    };
    let signer = match GrantSigner::new(SIGNING_KEY.as_bytes().to_vec()) {
        Ok(s) => s,
        Err(e) => panic!("fixture signing key invalid: {e}"),
    };
    GateParts {
        registry: Arc::new(registry),
        verifier: Arc::new(verifier),
        lockout,
        issuer: AccessTokenIssuer::new(signer, GRANT_TTL, vec![GRANT_SCOPE.to_string()]),
        session_ttl: SESSION_TTL,
    }
}

// ---------------------------------------------------------------------------
// Config fixtures
// ---------------------------------------------------------------------------

/// Layered-config equivalent of [`vault_parts`] with default lockout.
pub fn vault_config_yaml() -> String {
    let factors = |ids: &[&str], phrase: bool| -> String {
        ids.iter()
            .map(|id| {
                if phrase {
                    format!("      - {{ id: {id}, normalize: phrase }}\n")
                } else {
                    format!("      - {{ id: {id} }}\n")
                }
            })
            .collect()
    };
    format!(
        r#"gate:
  session_ttl_secs: {ttl}
  grant_ttl_secs: {grant_ttl}
  grant_scope: ["{scope}"]
lockout:
  failure_threshold: 3
  base_backoff_secs: 30
  max_backoff_secs: 3600
  session_lockout_limit: 3
  session_lock_secs: 900
signing:
  key_env: {key_env}
stages:
  - id: context-check
    name: Context check
    threshold: 1
    factors:
{ctx}  - id: recovery-phrases
    name: Recovery phrases
    threshold: 4
    factors:
{phrases}  - id: admin-passwords
    name: Admin passwords
    threshold: 4
    factors:
{passwords}"#,
        ttl = SESSION_TTL.as_secs(),
        grant_ttl = GRANT_TTL.as_secs(),
        scope = GRANT_SCOPE,
        key_env = SIGNING_KEY_ENV,
        ctx = factors(&[CONTEXT_FACTOR], false),
        phrases = factors(&PHRASE_FACTORS, true),
        passwords = factors(&PASSWORD_FACTORS, false),
    )
}

/// Env var name → value, as `resolve_secrets_with` expects for [`vault_config_yaml`].
pub fn vault_env() -> HashMap<String, String> {
    let mut env: HashMap<String, String> = all_factors()
        .map(|f| (vg_config::secrets::default_material_env(f), material_for(f)))
        .collect();
    env.insert(SIGNING_KEY_ENV.to_string(), SIGNING_KEY.to_string());
    env
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A controller over an in-memory store with a hand-driven clock.
pub struct Harness {
    pub gate: GateController<MemoryStore>,
    pub clock: ManualClock,
    pub audit: Arc<MemoryAuditLog>,
    pub store: Arc<MemoryStore>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_lockout(LockoutPolicy::default())
    }

    pub fn with_lockout(lockout: LockoutPolicy) -> Self {
        Self::sharing(Arc::new(MemoryStore::new()), vault_parts(lockout), ManualClock::new(epoch()))
    }

    /// A second controller over an existing store. Lock maps are NOT shared.
    pub fn sharing(store: Arc<MemoryStore>, parts: GateParts, clock: ManualClock) -> Self {
        let audit = Arc::new(MemoryAuditLog::new());
        let gate = GateController::new(parts, store.clone(), audit.clone(), Arc::new(clock.clone()));
        Self {
            gate,
            clock,
            audit,
            store,
        }
    }

    pub async fn open(&self) -> GateResult<SessionId> {
        let s = self
            .gate
            .create_session(
                SubjectId::new(SUBJECT),
                serde_json::json!({"origin": "127.0.0.1", "user_agent": "vg-testkit"}),
            )
            .await?;
        Ok(s.session_id)
    }

    pub async fn submit(&self, session: SessionId, factor: &str, secret: &str) -> GateResult<Outcome> {
        self.gate.submit(session, &FactorId::new(factor), secret).await
    }

    /// Submit the correct secret for `factor`.
    pub async fn submit_correct(&self, session: SessionId, factor: &str) -> GateResult<Outcome> {
        self.submit(session, factor, secret_for(factor).unwrap_or_default())
            .await
    }

    /// Submit every factor of stage `order` correctly; returns each outcome.
    pub async fn pass_stage(&self, session: SessionId, order: u32) -> GateResult<Vec<Outcome>> {
        let factors: Vec<String> = self
            .gate
            .registry()
            .stage_at(order)
            .map(|s| s.required_factors.iter().map(|f| f.to_string()).collect())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(factors.len());
        for f in factors {
            out.push(self.submit_correct(session, &f).await?);
        }
        Ok(out)
    }

    /// Persisted session as the store holds it right now.
    pub async fn snapshot(&self, session: SessionId) -> anyhow::Result<Option<GateSession>> {
        self.store.load_session(session).await
    }

    pub fn advance(&self, d: Duration) {
        self.clock.advance(d);
    }
}
