//! Verification material and grant token utilities.

use anyhow::{Context, Result};
use chrono::Utc;
use vg_config::secrets::parse_env_names;
use vg_gate::{hash_secret, GrantSigner, Normalization};

/// Material for a secret read from stdin. The secret itself is never printed.
pub fn hash_secret_cmd(normalization: Normalization) -> Result<()> {
    let secret = super::read_secret_stdin()?;
    println!("{}", hash_secret(&secret, normalization));
    Ok(())
}

/// Check a grant token's signature and print its claims.
///
/// The key comes from the env var named by `signing.key_env` in the config.
pub fn token_verify(token: &str, config_paths: &[String]) -> Result<()> {
    let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
    let loaded = vg_config::load_layered_yaml(&path_refs)?;
    let names = parse_env_names(&loaded.config_json)?;
    let key = std::env::var(&names.signing_key_var)
        .with_context(|| format!("signing key env var '{}' is not set", names.signing_key_var))?;

    let signer = GrantSigner::new(key.into_bytes())?;
    let claims = signer.verify(token)?;
    let expired = claims.is_expired(Utc::now());

    println!("signature_ok=true");
    println!("grant_id={}", claims.grant_id);
    println!("session_id={}", claims.session_id);
    println!("subject_id={}", claims.subject_id);
    println!("scope={}", claims.scope.join(","));
    println!("issued_at_utc={}", claims.issued_at.to_rfc3339());
    println!("expires_at_utc={}", claims.expires_at.to_rfc3339());
    println!("expired={}", expired);
    Ok(())
}
