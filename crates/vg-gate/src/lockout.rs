//! Lockout policy: failure counting, exponential backoff, session escalation.
//!
//! Per (session, stage), the k-th failure with `k >= F` blocks the stage for
//! `base * 2^(k-F)`, capped at `max_backoff`. Each such block is one lockout;
//! once a session accumulates `session_lockout_limit` lockouts the whole
//! session is locked for `session_lock`.
//!
//! Counters are cumulative: a successful factor does not reset them.
//! Nothing here sleeps. Callers get a `retry_after` and return immediately.

use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{plus, remaining, GateSession, SessionState, StageId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockoutCheck {
    Allowed,
    Blocked { retry_after: Duration },
}

/// Result of recording one failed verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailureVerdict {
    /// Failures left before the stage locks. Zero once locked.
    pub attempts_remaining: u32,
    /// `Some` when this failure locked the stage (or session).
    pub retry_after: Option<Duration>,
    /// This failure escalated to a session-wide lock.
    pub session_locked: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub failure_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Zero disables session escalation.
    pub session_lockout_limit: u32,
    pub session_lock: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),
            session_lockout_limit: 3,
            session_lock: Duration::from_secs(900),
        }
    }
}

impl LockoutPolicy {
    /// Build from the `lockout` section of the loaded config JSON.
    /// Absent keys keep their defaults.
    pub fn from_config_json(cfg: &Value) -> Result<Self> {
        let mut p = Self::default();
        let read = |key: &str| -> Result<Option<u64>> {
            match cfg.pointer(&format!("/lockout/{key}")) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => match v.as_u64() {
                    Some(n) => Ok(Some(n)),
                    None => bail!("lockout.{key} must be a non-negative integer (got {v})"),
                },
            }
        };

        if let Some(n) = read("failure_threshold")? {
            p.failure_threshold = u32::try_from(n)?;
        }
        if let Some(n) = read("base_backoff_secs")? {
            p.base_backoff = Duration::from_secs(n);
        }
        if let Some(n) = read("max_backoff_secs")? {
            p.max_backoff = Duration::from_secs(n);
        }
        if let Some(n) = read("session_lockout_limit")? {
            p.session_lockout_limit = u32::try_from(n)?;
        }
        if let Some(n) = read("session_lock_secs")? {
            p.session_lock = Duration::from_secs(n);
        }

        if p.failure_threshold == 0 {
            bail!("lockout.failure_threshold must be >= 1");
        }
        if p.base_backoff.is_zero() {
            bail!("lockout.base_backoff_secs must be >= 1");
        }
        if p.max_backoff < p.base_backoff {
            bail!("lockout.max_backoff_secs must be >= base_backoff_secs");
        }
        Ok(p)
    }

    /// Backoff for the k-th failure (`k >= failure_threshold`).
    pub fn backoff(&self, k: u32) -> Duration {
        let exp = k.saturating_sub(self.failure_threshold);
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// May a verification for `stage` be attempted now?
    ///
    /// The single authority consulted before every verification.
    pub fn check(&self, session: &GateSession, stage: &StageId, now: DateTime<Utc>) -> LockoutCheck {
        let stage_until = session.stage_blocked_until.get(stage).copied();
        let session_until = match session.state {
            SessionState::Locked { until } => Some(until),
            _ => None,
        };

        match stage_until.into_iter().chain(session_until).max() {
            Some(until) if until > now => LockoutCheck::Blocked {
                retry_after: remaining(now, until),
            },
            _ => LockoutCheck::Allowed,
        }
    }

    /// Count one failed verification for (session, stage).
    pub fn record_failure(
        &self,
        session: &mut GateSession,
        stage: &StageId,
        now: DateTime<Utc>,
    ) -> FailureVerdict {
        let k = {
            let c = session.fail_counts.entry(stage.clone()).or_insert(0);
            *c = c.saturating_add(1);
            *c
        };
        let attempts_remaining = self.failure_threshold.saturating_sub(k);

        if k < self.failure_threshold {
            return FailureVerdict {
                attempts_remaining,
                retry_after: None,
                session_locked: false,
            };
        }

        let mut until = plus(now, self.backoff(k));
        session.stage_blocked_until.insert(stage.clone(), until);
        session.lockouts = session.lockouts.saturating_add(1);

        let session_locked =
            self.session_lockout_limit > 0 && session.lockouts >= self.session_lockout_limit;
        if session_locked {
            until = until.max(plus(now, self.session_lock));
        }
        if let SessionState::Locked { until: prev } = session.state {
            until = until.max(prev);
        }
        session.state = SessionState::Locked { until };

        FailureVerdict {
            attempts_remaining,
            retry_after: Some(remaining(now, until)),
            session_locked,
        }
    }
}
