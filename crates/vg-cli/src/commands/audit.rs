//! Audit trail utilities.

use anyhow::Result;
use vg_audit::{verify_hash_chain, VerifyResult};

/// Verify a JSONL audit log's hash chain. Broken chains are an error.
pub fn audit_verify(path: &str) -> Result<()> {
    match verify_hash_chain(path)? {
        VerifyResult::Valid { lines } => {
            println!("chain_valid=true lines={}", lines);
            Ok(())
        }
        VerifyResult::Broken { line, reason } => {
            println!("chain_valid=false line={}", line);
            anyhow::bail!("AUDIT_CHAIN_BROKEN at line {}: {}", line, reason)
        }
    }
}
