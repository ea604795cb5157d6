//! Credential verifier.
//!
//! Verification material is `sha256$<salt-hex>$<digest-hex>` where
//! `digest = SHA-256(salt || normalized secret)`. Material is loaded from the
//! [`SecretStore`] once, at construction; `verify` does no I/O.
//!
//! Comparison uses `subtle::ConstantTimeEq` over the full digest. A failed
//! comparison reports only `NoMatch`.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{GateError, GateResult};
use crate::registry::StageRegistry;
use crate::types::{plus, remaining, FactorId, Normalization, SubjectId};

const MATERIAL_SCHEME: &str = "sha256";
const SALT_LEN: usize = 16;
const RATE_WINDOW: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Secret store seam
// ---------------------------------------------------------------------------

/// Source of canonical verification material.
///
/// Provenance (seeding, rotation) is the store's business. The gate only
/// reads, and only at startup.
pub trait SecretStore: Send + Sync {
    fn lookup_verification_material(&self, factor: &FactorId) -> anyhow::Result<Option<String>>;
}

/// Fixed in-memory material map.
#[derive(Clone, Debug, Default)]
pub struct StaticSecretStore {
    material: BTreeMap<FactorId, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, factor: impl Into<String>, material: impl Into<String>) {
        self.material.insert(FactorId::new(factor), material.into());
    }
}

impl FromIterator<(FactorId, String)> for StaticSecretStore {
    fn from_iter<I: IntoIterator<Item = (FactorId, String)>>(iter: I) -> Self {
        Self {
            material: iter.into_iter().collect(),
        }
    }
}

impl SecretStore for StaticSecretStore {
    fn lookup_verification_material(&self, factor: &FactorId) -> anyhow::Result<Option<String>> {
        Ok(self.material.get(factor).cloned())
    }
}

// ---------------------------------------------------------------------------
// Material
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Material {
    salt: Vec<u8>,
    digest: [u8; 32],
}

impl Material {
    fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('$');
        if parts.next()? != MATERIAL_SCHEME {
            return None;
        }
        let salt = hex::decode(parts.next()?).ok()?;
        let digest: [u8; 32] = hex::decode(parts.next()?).ok()?.try_into().ok()?;
        if parts.next().is_some() || salt.is_empty() {
            return None;
        }
        Some(Self { salt, digest })
    }
}

/// Canonical form of a secret before hashing.
pub fn normalize(secret: &str, n: Normalization) -> String {
    match n {
        Normalization::Exact => secret.to_string(),
        Normalization::Phrase => secret
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn digest(salt: &[u8], normalized: &str) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(salt);
    h.update(normalized.as_bytes());
    h.finalize().into()
}

/// Produce material for `secret` with a fresh random salt.
pub fn hash_secret(secret: &str, n: Normalization) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    hash_secret_with_salt(secret, n, &salt)
}

/// Deterministic variant of [`hash_secret`].
pub fn hash_secret_with_salt(secret: &str, n: Normalization, salt: &[u8]) -> String {
    let d = digest(salt, &normalize(secret, n));
    format!("{MATERIAL_SCHEME}${}${}", hex::encode(salt), hex::encode(d))
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Match,
    NoMatch,
    /// The subject's verification budget for this factor is exhausted; no
    /// comparison ran.
    RateLimited { retry_after: Duration },
}

struct Entry {
    material: Material,
    normalization: Normalization,
}

pub struct CredentialVerifier {
    entries: BTreeMap<FactorId, Entry>,
    /// `None` disables the per-(subject, factor) budget.
    max_per_window: Option<u32>,
    windows: Mutex<BTreeMap<(SubjectId, FactorId), (DateTime<Utc>, u32)>>,
}

impl CredentialVerifier {
    /// Load material for every registry factor.
    ///
    /// Fails with `MissingMaterial` / `MalformedMaterial` naming the factor,
    /// never the material.
    pub fn preload(
        registry: &StageRegistry,
        store: &dyn SecretStore,
        max_verifications_per_minute: Option<u32>,
    ) -> GateResult<Self> {
        let mut entries = BTreeMap::new();
        for stage in registry.stages() {
            for factor in &stage.required_factors {
                let raw = store
                    .lookup_verification_material(factor)
                    .map_err(GateError::Store)?
                    .ok_or_else(|| GateError::MissingMaterial(factor.clone()))?;
                let material = Material::parse(&raw)
                    .ok_or_else(|| GateError::MalformedMaterial(factor.clone()))?;
                entries.insert(
                    factor.clone(),
                    Entry {
                        material,
                        normalization: stage.normalization_of(factor),
                    },
                );
            }
        }

        Ok(Self {
            entries,
            max_per_window: max_verifications_per_minute.filter(|m| *m > 0),
            windows: Mutex::new(BTreeMap::new()),
        })
    }

    /// Compare `secret` against the stored material for `factor`, charging
    /// one unit of `subject`'s budget for that factor.
    ///
    /// The budget is keyed by subject so one caller cannot exhaust it for
    /// everyone else. Opening fresh sessions does not reset it.
    pub fn verify(&self, subject: &SubjectId, factor: &FactorId, secret: &str, now: DateTime<Utc>) -> VerifyOutcome {
        if let Some(retry_after) = self.take_budget(subject, factor, now) {
            return VerifyOutcome::RateLimited { retry_after };
        }

        let Some(entry) = self.entries.get(factor) else {
            return VerifyOutcome::NoMatch;
        };

        let candidate = digest(
            &entry.material.salt,
            &normalize(secret, entry.normalization),
        );
        if bool::from(candidate.ct_eq(&entry.material.digest)) {
            VerifyOutcome::Match
        } else {
            VerifyOutcome::NoMatch
        }
    }

    /// Returns `Some(retry_after)` when the current window is exhausted.
    fn take_budget(&self, subject: &SubjectId, factor: &FactorId, now: DateTime<Utc>) -> Option<Duration> {
        let max = self.max_per_window?;
        let mut windows = match self.windows.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let slot = windows
            .entry((subject.clone(), factor.clone()))
            .or_insert((now, 0));
        let window_end = plus(slot.0, RATE_WINDOW);
        if now >= window_end {
            *slot = (now, 0);
        }
        if slot.1 >= max {
            return Some(remaining(now, plus(slot.0, RATE_WINDOW)));
        }
        slot.1 += 1;
        None
    }
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("factors", &self.entries.keys().collect::<Vec<_>>())
            .field("material", &"<REDACTED>")
            .field("max_per_window", &self.max_per_window)
            .finish()
    }
}
