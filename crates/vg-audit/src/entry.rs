//! Audit entry types.
//!
//! An entry never carries the submitted secret. Factor ids and stage ids are
//! public catalog names, so they are safe to record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of one credential comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Match,
    NoMatch,
}

/// What produced the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    SessionCreated,
    Submit,
    SessionAborted,
    SessionExpired,
    GrantIssued,
}

/// One append-only audit record.
///
/// `verification` is `Some` only when the verifier actually compared the
/// secret. Submissions refused before verification (out of order, locked,
/// terminal state) carry `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub session_id: Uuid,
    pub kind: EntryKind,
    pub stage_id: Option<String>,
    pub factor_id: Option<String>,
    /// Snake-case outcome tag, e.g. `advanced`, `invalid`, `session_locked`.
    pub outcome: String,
    pub verification: Option<AttemptResult>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    /// Lifecycle entry with no stage/factor context.
    pub fn lifecycle(
        session_id: Uuid,
        kind: EntryKind,
        outcome: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            kind,
            stage_id: None,
            factor_id: None,
            outcome: outcome.into(),
            verification: None,
            at,
        }
    }

    /// The factor attempt embedded in this entry, if a comparison ran.
    pub fn factor_attempt(&self) -> Option<FactorAttempt> {
        let result = self.verification?;
        Some(FactorAttempt {
            session_id: self.session_id,
            stage_id: self.stage_id.clone()?,
            factor_id: self.factor_id.clone()?,
            result,
            at: self.at,
        })
    }
}

/// Immutable record of a single factor verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorAttempt {
    pub session_id: Uuid,
    pub stage_id: String,
    pub factor_id: String,
    pub result: AttemptResult,
    pub at: DateTime<Utc>,
}
