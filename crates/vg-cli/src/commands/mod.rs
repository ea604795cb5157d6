//! Command handler modules for vg-cli.
//!
//! Shared utilities used by multiple command paths live here.
//! Command-specific logic lives in the submodules.

pub mod audit;
pub mod config;
pub mod secret;

use anyhow::{Context, Result};
use std::io::Read;
use vg_gate::Normalization;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a CLI `--normalize` string.
pub fn parse_normalization(s: &str) -> Result<Normalization> {
    match s.trim().to_lowercase().as_str() {
        "exact" => Ok(Normalization::Exact),
        "phrase" => Ok(Normalization::Phrase),
        other => anyhow::bail!("invalid --normalize '{}'. expected one of: exact | phrase", other),
    }
}

/// Read one secret from stdin. Only the trailing line break is stripped so
/// exact-match secrets keep their surrounding whitespace.
pub fn read_secret_stdin() -> Result<String> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("read secret from stdin failed")?;
    let raw = raw.strip_suffix('\n').unwrap_or(&raw);
    let raw = raw.strip_suffix('\r').unwrap_or(raw);
    if raw.is_empty() {
        anyhow::bail!("no secret on stdin");
    }
    Ok(raw.to_string())
}
