//! Layered YAML configuration for the vault gate.
//!
//! - Layers merge in order; later documents override earlier ones.
//! - The merged tree is hashed over its canonical JSON (sorted keys).
//! - Secret-looking literals are refused: config holds env var NAMES only.
//! - `report_unused_keys` flags leaves no component reads.

use std::fs;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub mod consumption;
pub mod secrets;

pub use consumption::{report_unused_keys, ConfigSurface, UnusedKeyPolicy, UnusedKeyReport};

/// A leaf string starting with any of these aborts loading with
/// CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "sha256$", // inline verification material
    "-----BEGIN",
    "sk-",
    "sk_live",
    "sk_test",
    "AKIA",
    "ghp_",
    "gho_",
    "glpat-",
    "xoxb-",
    "xoxp-",
];

/// The merged config plus its identity.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Hex SHA-256 of `canonical_json`.
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

/// Read and merge YAML files, in order.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("read config layer {p}")))
        .collect::<Result<Vec<String>>>()?;
    let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

/// Same as [`load_layered_yaml`] over in-memory documents.
pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let merged = yaml_docs
        .iter()
        .enumerate()
        .try_fold(Value::Object(Default::default()), |acc, (i, raw)| {
            let layer: serde_yaml::Value =
                serde_yaml::from_str(raw).with_context(|| format!("invalid yaml in layer {i}"))?;
            let layer = serde_json::to_value(layer).with_context(|| format!("layer {i} is not json-compatible"))?;
            Ok::<_, anyhow::Error>(merge_layer(acc, layer))
        })?;

    refuse_secret_literals(&merged)?;

    // serde_json's default Map is a BTreeMap, so keys serialize sorted.
    let canonical_json = serde_json::to_string(&merged).context("canonical json")?;
    Ok(LoadedConfig {
        config_hash: hex::encode(Sha256::digest(canonical_json.as_bytes())),
        canonical_json,
        config_json: merged,
    })
}

/// Objects merge key by key; anything else (arrays included) is replaced.
fn merge_layer(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut into), Value::Object(from)) => {
            for (k, v) in from {
                let merged = match into.remove(&k) {
                    Some(existing) => merge_layer(existing, v),
                    None => v,
                };
                into.insert(k, merged);
            }
            Value::Object(into)
        }
        (_, overlay) => overlay,
    }
}

fn refuse_secret_literals(root: &Value) -> Result<()> {
    for ptr in consumption::leaf_pointers(root) {
        let Some(s) = root.pointer(&ptr).and_then(Value::as_str) else {
            continue;
        };
        if looks_like_secret(s) {
            bail!("CONFIG_SECRET_DETECTED leaf={ptr} value=REDACTED");
        }
    }
    Ok(())
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    t.len() >= 8 && SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}
