//! Which config keys each binary actually reads.
//!
//! A leaf nobody reads is usually a typo (`grant_scopes:`) that silently
//! leaves a default in force, so every surface can report them.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which binary is reading the config. Determines the consumed-key registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSurface {
    /// Gate core only: stages, lockout, verifier, grants, signing.
    Gate,
    /// The daemon: gate core plus audit sink and background tasks.
    Daemon,
}

impl ConfigSurface {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSurface::Gate => "GATE",
            ConfigSurface::Daemon => "DAEMON",
        }
    }

    /// JSON-pointer prefixes read on this surface. A leaf at or under any of
    /// them counts as consumed.
    pub fn consumed_pointers(self) -> Vec<&'static str> {
        let mut out = GATE_READS.to_vec();
        if self == ConfigSurface::Daemon {
            out.extend_from_slice(DAEMON_READS);
        }
        out
    }
}

const GATE_READS: &[&str] = &[
    // GateParts / AccessTokenIssuer
    "/gate/session_ttl_secs",
    "/gate/grant_ttl_secs",
    "/gate/grant_scope",
    "/verifier/max_verifications_per_minute",
    // LockoutPolicy
    "/lockout/failure_threshold",
    "/lockout/base_backoff_secs",
    "/lockout/max_backoff_secs",
    "/lockout/session_lockout_limit",
    "/lockout/session_lock_secs",
    // StageRegistry + secrets::resolve_secrets
    "/stages",
    "/signing/key_env",
];

const DAEMON_READS: &[&str] = &["/audit/path", "/audit/hash_chain", "/daemon/sweep_interval_secs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    pub surface: String,
    /// Consumed prefixes this report checked against (sorted, unique).
    pub consumed_prefixes: Vec<String>,
    /// Leaves under none of them (sorted).
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Unused-key report for `surface`. `Fail` errors when anything is unused.
pub fn report_unused_keys(
    surface: ConfigSurface,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let mut consumed: Vec<String> = surface
        .consumed_pointers()
        .into_iter()
        .map(|p| format!("/{}", p.trim().trim_matches('/')))
        .collect();
    consumed.sort();
    consumed.dedup();

    let mut unused: Vec<String> = leaf_pointers(config_json)
        .into_iter()
        .filter(|leaf| !consumed.iter().any(|c| covers(c, leaf)))
        .collect();
    unused.sort();

    if policy == UnusedKeyPolicy::Fail && !unused.is_empty() {
        let shown: Vec<&str> = unused.iter().take(12).map(String::as_str).collect();
        bail!(
            "CONFIG_UNUSED_KEYS (surface={}): {} config key(s) are read by nothing; \
             remove them or register the reader. unused: {}",
            surface.as_str(),
            unused.len(),
            shown.join(", ")
        );
    }

    Ok(UnusedKeyReport {
        surface: surface.as_str().to_string(),
        consumed_prefixes: consumed,
        unused_leaf_pointers: unused,
    })
}

/// Segment-wise prefix: `/a/b` covers `/a/b` and `/a/b/c`, not `/a/bc`.
pub(crate) fn covers(prefix: &str, leaf: &str) -> bool {
    let mut leaf_segs = leaf.split('/').filter(|s| !s.is_empty());
    prefix
        .split('/')
        .filter(|s| !s.is_empty())
        .all(|seg| leaf_segs.next() == Some(seg))
}

/// JSON pointers of every scalar leaf. Empty objects and arrays have none.
pub(crate) fn leaf_pointers(root: &Value) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack: Vec<(String, &Value)> = vec![(String::new(), root)];
    while let Some((ptr, v)) = stack.pop() {
        match v {
            Value::Object(map) => {
                for (k, child) in map {
                    let token = k.replace('~', "~0").replace('/', "~1");
                    stack.push((format!("{ptr}/{token}"), child));
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    stack.push((format!("{ptr}/{i}"), child));
                }
            }
            _ if ptr.is_empty() => out.push("/".to_string()),
            _ => out.push(ptr),
        }
    }
    out
}
