//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES** (`signing.key_env`,
//!   `stages[].factors[].material_env`).
//! - Callers resolve once at startup and pass [`ResolvedSecrets`] into
//!   constructors; nothing else reads these env vars.
//! - `Debug` redacts every value. Errors name the env var, never its value.
//!
//! Every factor needs material and the signing key is required: the gate
//! cannot start without them.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde_json::Value;

pub const DEFAULT_SIGNING_KEY_ENV: &str = "VG_SIGNING_KEY";

/// Secrets for one gate instance. **Values are redacted in `Debug` output.**
#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Grant token HMAC key.
    pub signing_key: String,
    /// factor id → verification material (`sha256$salt$digest`).
    pub factor_material: BTreeMap<String, String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let factors: BTreeMap<&str, &str> = self
            .factor_material
            .keys()
            .map(|k| (k.as_str(), "<REDACTED>"))
            .collect();
        f.debug_struct("ResolvedSecrets")
            .field("signing_key", &"<REDACTED>")
            .field("factor_material", &factors)
            .finish()
    }
}

/// Env var names referenced by the config, in a stable order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretEnvNames {
    pub signing_key_var: String,
    /// (factor id, env var name)
    pub factor_vars: Vec<(String, String)>,
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// `VG_FACTOR_<ID>` with non-alphanumerics mapped to `_`.
pub fn default_material_env(factor_id: &str) -> String {
    let tail: String = factor_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("VG_FACTOR_{tail}")
}

/// Extract env var names from the loaded config. Factors without
/// `material_env` fall back to [`default_material_env`].
pub fn parse_env_names(config_json: &Value) -> Result<SecretEnvNames> {
    let signing_key_var = read_str_at(config_json, "/signing/key_env")
        .unwrap_or_else(|| DEFAULT_SIGNING_KEY_ENV.to_string());

    let mut factor_vars = Vec::new();
    let stages = config_json
        .pointer("/stages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for (i, stage) in stages.iter().enumerate() {
        let factors = stage
            .get("factors")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for (j, f) in factors.iter().enumerate() {
            let Some(id) = f.get("id").and_then(Value::as_str) else {
                bail!("SECRETS_BAD_CONFIG: stages[{i}].factors[{j}] missing id");
            };
            let var = read_str_at(f, "/material_env").unwrap_or_else(|| default_material_env(id));
            factor_vars.push((id.to_string(), var));
        }
    }

    Ok(SecretEnvNames {
        signing_key_var,
        factor_vars,
    })
}

/// Resolve all secrets from the process environment.
pub fn resolve_secrets(config_json: &Value) -> Result<ResolvedSecrets> {
    resolve_secrets_with(config_json, |name| std::env::var(name).ok())
}

/// Resolve through `lookup` instead of the process environment.
///
/// Blank values count as missing. The first missing variable fails with
/// SECRETS_MISSING naming it.
pub fn resolve_secrets_with<F>(config_json: &Value, lookup: F) -> Result<ResolvedSecrets>
where
    F: Fn(&str) -> Option<String>,
{
    let names = parse_env_names(config_json)?;
    let resolve = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

    let Some(signing_key) = resolve(&names.signing_key_var) else {
        bail!(
            "SECRETS_MISSING: required env var '{}' (grant signing key) is not set or empty",
            names.signing_key_var
        );
    };

    let mut factor_material = BTreeMap::new();
    for (factor, var) in &names.factor_vars {
        let Some(material) = resolve(var) else {
            bail!(
                "SECRETS_MISSING: required env var '{var}' (material for factor '{factor}') is not set or empty"
            );
        };
        factor_material.insert(factor.clone(), material.trim().to_string());
    }

    Ok(ResolvedSecrets {
        signing_key,
        factor_material,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_env_name_is_upper_snake() {
        assert_eq!(default_material_env("phrase-2"), "VG_FACTOR_PHRASE_2");
        assert_eq!(default_material_env("ctx"), "VG_FACTOR_CTX");
    }

    #[test]
    fn explicit_names_win_over_defaults() {
        let cfg = json!({
            "signing": {"key_env": "MY_KEY"},
            "stages": [{"id": "s", "factors": [{"id": "a", "material_env": "A_ENV"}, {"id": "b"}]}]
        });
        let names = parse_env_names(&cfg).unwrap();
        assert_eq!(names.signing_key_var, "MY_KEY");
        assert_eq!(
            names.factor_vars,
            vec![
                ("a".to_string(), "A_ENV".to_string()),
                ("b".to_string(), "VG_FACTOR_B".to_string())
            ]
        );
    }
}
