//! Config inspection: hash, validate, list the env vars a deployment needs.

use anyhow::{Context, Result};
use vg_config::secrets::{parse_env_names, resolve_secrets};
use vg_config::{report_unused_keys, ConfigSurface, UnusedKeyPolicy};
use vg_gate::{LockoutPolicy, StageRegistry};

pub fn config_hash(paths: &[String]) -> Result<()> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = vg_config::load_layered_yaml(&path_refs)?;
    println!("config_hash={}", loaded.config_hash);
    println!("{}", loaded.canonical_json);
    Ok(())
}

/// Validate a layered config without starting anything.
///
/// - `strict`: unused keys fail instead of warn.
/// - `resolve`: also require every referenced env var to be set.
pub fn config_check(paths: &[String], surface: ConfigSurface, strict: bool, resolve: bool) -> Result<()> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = vg_config::load_layered_yaml(&path_refs)?;

    let policy = if strict {
        UnusedKeyPolicy::Fail
    } else {
        UnusedKeyPolicy::Warn
    };
    let report = report_unused_keys(surface, &loaded.config_json, policy)?;
    for p in &report.unused_leaf_pointers {
        eprintln!("WARN unused_key={}", p);
    }

    let registry = StageRegistry::from_config_json(&loaded.config_json).context("stages")?;
    LockoutPolicy::from_config_json(&loaded.config_json).context("lockout")?;
    let names = parse_env_names(&loaded.config_json)?;

    println!("config_hash={}", loaded.config_hash);
    println!("surface={}", surface.as_str());
    for stage in registry.stages() {
        println!(
            "stage order={} id={} threshold={}/{}",
            stage.order,
            stage.id,
            stage.threshold,
            stage.required_factors.len()
        );
    }
    println!("env signing_key={}", names.signing_key_var);
    for (factor, var) in &names.factor_vars {
        println!("env factor={} var={}", factor, var);
    }

    if resolve {
        resolve_secrets(&loaded.config_json)?;
        println!("secrets_resolved=true");
    }
    println!("config_ok=true");
    Ok(())
}

pub fn parse_surface(s: &str) -> Result<ConfigSurface> {
    match s.trim().to_uppercase().as_str() {
        "GATE" => Ok(ConfigSurface::Gate),
        "DAEMON" => Ok(ConfigSurface::Daemon),
        other => anyhow::bail!("invalid --surface '{}'. expected one of: GATE | DAEMON", other),
    }
}
