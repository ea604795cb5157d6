//! Gate errors that are not caller outcomes.
//!
//! Anything a caller can cause by submitting the wrong thing is an
//! [`Outcome`](crate::Outcome). `GateError` covers startup configuration
//! faults, collaborator failures, and unknown sessions.

use crate::types::{FactorId, SessionId};

#[derive(Debug)]
pub enum GateError {
    /// No session with this id exists in the store.
    SessionNotFound(SessionId),
    /// Stage catalog failed validation at construction. Fatal at startup.
    InvalidRegistry(String),
    /// Secret store holds no verification material for a registry factor.
    MissingMaterial(FactorId),
    /// Verification material could not be parsed.
    MalformedMaterial(FactorId),
    /// Grant store reported an existing grant that could not be read back.
    /// Indicates the store is not providing insert-if-absent atomicity.
    DuplicateIssuance(SessionId),
    /// Persistence layer failure.
    Store(anyhow::Error),
    /// Audit sink failure.
    Audit(anyhow::Error),
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::SessionNotFound(id) => write!(f, "GATE_SESSION_NOT_FOUND: {id}"),
            GateError::InvalidRegistry(reason) => write!(f, "GATE_INVALID_REGISTRY: {reason}"),
            GateError::MissingMaterial(factor) => {
                write!(f, "GATE_MISSING_MATERIAL: no verification material for factor '{factor}'")
            }
            GateError::MalformedMaterial(factor) => {
                write!(f, "GATE_MALFORMED_MATERIAL: factor '{factor}' material=REDACTED")
            }
            GateError::DuplicateIssuance(id) => {
                write!(f, "GATE_DUPLICATE_ISSUANCE: grant store lost atomicity for session {id}")
            }
            GateError::Store(e) => write!(f, "GATE_STORE: {e:#}"),
            GateError::Audit(e) => write!(f, "GATE_AUDIT: {e:#}"),
        }
    }
}

impl std::error::Error for GateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GateError::Store(e) | GateError::Audit(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;
