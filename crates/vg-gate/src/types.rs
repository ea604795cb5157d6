//! Gate data model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Gate session identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! string_id {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Caller identity supplied by the identity provider.
    SubjectId
);
string_id!(
    /// Stable stage name, e.g. `recovery-phrases`.
    StageId
);
string_id!(
    /// Stable factor name, e.g. `phrase-2`.
    FactorId
);

// ---------------------------------------------------------------------------
// Stage catalog
// ---------------------------------------------------------------------------

/// How a submitted secret is canonicalized before hashing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Byte-exact (passwords, context tokens).
    #[default]
    Exact,
    /// Trimmed, lower-cased, internal whitespace collapsed (recovery phrases).
    Phrase,
}

/// One ordered step of the gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    pub order: u32,
    pub required_factors: BTreeSet<FactorId>,
    /// M in M-of-N.
    pub threshold: u32,
    /// Per-factor normalization; factors absent here are `Exact`.
    pub normalization: BTreeMap<FactorId, Normalization>,
}

impl Stage {
    pub fn new(
        id: impl Into<String>,
        order: u32,
        factors: impl IntoIterator<Item = impl Into<String>>,
        threshold: u32,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: StageId(id),
            order,
            required_factors: factors.into_iter().map(|f| FactorId(f.into())).collect(),
            threshold,
            normalization: BTreeMap::new(),
        }
    }

    /// Builder: mark every factor of this stage with `n`.
    pub fn with_normalization(mut self, n: Normalization) -> Self {
        self.normalization = self.required_factors.iter().map(|f| (f.clone(), n)).collect();
        self
    }

    pub fn normalization_of(&self, factor: &FactorId) -> Normalization {
        self.normalization.get(factor).copied().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Exactly one of these at a time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    InProgress,
    /// Verification refused until `until`.
    Locked { until: DateTime<Utc> },
    /// **Terminal.**
    Completed,
    /// **Terminal.**
    Aborted,
    /// **Terminal.**
    Expired,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Locked { .. } => "locked",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }
}

/// Persisted state of one caller working through the gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSession {
    pub session_id: SessionId,
    pub subject_id: SubjectId,
    /// Opaque identity-provider context (e.g. caller origin). Stored, never interpreted.
    pub context: Value,
    pub current_stage_order: u32,
    pub verified_factors: BTreeMap<StageId, BTreeSet<FactorId>>,
    pub fail_counts: BTreeMap<StageId, u32>,
    /// Per-stage backoff deadlines set by the lockout policy.
    pub stage_blocked_until: BTreeMap<StageId, DateTime<Utc>>,
    /// Number of stage lockouts incurred so far.
    pub lockouts: u32,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Bumped by the store on every save; a save carrying a stale revision
    /// is rejected.
    #[serde(default)]
    pub revision: u64,
}

impl GateSession {
    pub fn new(
        subject_id: SubjectId,
        context: Value,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            subject_id,
            context,
            current_stage_order: 0,
            verified_factors: BTreeMap::new(),
            fail_counts: BTreeMap::new(),
            stage_blocked_until: BTreeMap::new(),
            lockouts: 0,
            state: SessionState::InProgress,
            created_at: now,
            expires_at: plus(now, ttl),
            revision: 0,
        }
    }

    pub fn is_past_ttl(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Progress / status
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub verified_count: u32,
    pub required_count: u32,
    pub complete: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage_id: StageId,
    pub order: u32,
    pub progress: StageProgress,
}

/// Read-only view returned by `get_status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatus {
    pub session_id: SessionId,
    pub state: SessionState,
    /// `None` once the session is completed.
    pub current_stage: Option<StageId>,
    pub current_stage_order: u32,
    pub per_stage_progress: Vec<StageStatus>,
    pub expires_at: DateTime<Utc>,
    /// The stored grant, once the session is completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant: Option<AccessGrant>,
}

/// Acknowledgement for `abort`. `state` is the session state after the call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub session_id: SessionId,
    pub state: SessionState,
}

// ---------------------------------------------------------------------------
// Grant
// ---------------------------------------------------------------------------

/// The scoped, time-boxed credential issued once per completed session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub grant_id: Uuid,
    pub session_id: SessionId,
    pub subject_id: SubjectId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub scope: Vec<String>,
    /// Signed opaque token carrying the fields above.
    pub token: String,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Caller-facing result of `submit`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Advanced { progress: StageProgress },
    StageComplete { next_stage: u32 },
    GateComplete { grant: AccessGrant },
    Invalid { attempts_remaining: u32 },
    SessionLocked {
        #[serde(with = "duration_secs")]
        retry_after: Duration,
    },
    StageOutOfOrder,
    UnknownFactor,
    SessionExpired,
    SessionAlreadyCompleted,
    SessionAborted,
}

impl Outcome {
    /// Snake-case tag, used in audit entries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "advanced",
            Self::StageComplete { .. } => "stage_complete",
            Self::GateComplete { .. } => "gate_complete",
            Self::Invalid { .. } => "invalid",
            Self::SessionLocked { .. } => "session_locked",
            Self::StageOutOfOrder => "stage_out_of_order",
            Self::UnknownFactor => "unknown_factor",
            Self::SessionExpired => "session_expired",
            Self::SessionAlreadyCompleted => "session_already_completed",
            Self::SessionAborted => "session_aborted",
        }
    }

    /// True when the caller may try again on this same session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Invalid { .. } | Self::SessionLocked { .. } | Self::StageOutOfOrder | Self::UnknownFactor
        )
    }
}

/// Whole seconds, rounded up so a client never retries early.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
        s.serialize_u64(secs)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// `at + d`, saturating instead of panicking on overflow.
pub(crate) fn plus(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|cd| at.checked_add_signed(cd))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Remaining time until `until`, zero if already past.
pub(crate) fn remaining(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}
