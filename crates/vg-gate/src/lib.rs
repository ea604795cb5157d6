//! vg-gate
//!
//! Staged vault access gate:
//! - `StageRegistry`: ordered, validated stage catalog (M-of-N factors per stage)
//! - `CredentialVerifier`: constant-time comparison against salted SHA-256 material
//! - `LockoutPolicy`: per-stage failure counts, exponential backoff, session escalation
//! - `GateController`: the per-session state machine
//! - `AccessTokenIssuer`: one signed, scoped, time-boxed grant per completed session
//!
//! Persistence and audit are traits (`SessionStore`, `GrantStore`, `AuditSink`);
//! `MemoryStore` is the in-process implementation.

mod clock;
mod controller;
mod error;
mod issuer;
mod lockout;
mod locks;
mod progress;
mod registry;
mod store;
mod types;
mod verifier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{GateController, GateParts, DEFAULT_SESSION_TTL};
pub use error::{GateError, GateResult};
pub use issuer::{AccessTokenIssuer, GrantSigner, TokenClaims, DEFAULT_GRANT_SCOPE, DEFAULT_GRANT_TTL};
pub use lockout::{FailureVerdict, LockoutCheck, LockoutPolicy};
pub use locks::SessionLocks;
pub use progress::ProgressTracker;
pub use registry::StageRegistry;
pub use store::{GateStore, GrantInsert, GrantStore, MemoryStore, SaveRejected, SessionStore};
pub use types::{
    AccessGrant, Ack, FactorId, GateSession, GateStatus, Normalization, Outcome, SessionId,
    SessionState, Stage, StageId, StageProgress, StageStatus, SubjectId,
};
pub use verifier::{
    hash_secret, hash_secret_with_salt, normalize, CredentialVerifier, SecretStore,
    StaticSecretStore, VerifyOutcome,
};

// Audit types appear in the controller's public API.
pub use vg_audit::{AttemptResult, AuditEntry, AuditSink, EntryKind, FactorAttempt, MemoryAuditLog};
