//! Gate controller: the session state machine.
//!
//! ```text
//! create_session ──► StageActive(0) ──► … ──► StageActive(last) ──► Completed
//!                         │                         │
//!                         ├── Locked{until} ◄───────┤   (lockout; lazily lifted)
//!                         ├── Expired               │   (TTL; lazily applied)
//!                         └── Aborted               │   (abort)
//! ```
//!
//! `Completed`, `Aborted` and `Expired` are terminal. Every `submit` runs under
//! the session's exclusive lock and appends one `Submit` audit entry, followed
//! by lifecycle entries for any expiry or grant it caused.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use vg_audit::{AttemptResult, AuditEntry, AuditSink, EntryKind};

use crate::clock::Clock;
use crate::error::{GateError, GateResult};
use crate::issuer::{AccessTokenIssuer, GrantSigner};
use crate::locks::SessionLocks;
use crate::lockout::{LockoutCheck, LockoutPolicy};
use crate::progress::ProgressTracker;
use crate::registry::StageRegistry;
use crate::store::{GateStore, SaveRejected};
use crate::types::{
    remaining, Ack, FactorId, GateSession, GateStatus, Outcome, SessionId, SessionState, StageId,
    StageStatus, SubjectId,
};
use crate::verifier::{CredentialVerifier, SecretStore, VerifyOutcome};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(1800);

/// Load-step-save rounds a submit or abort makes before giving up on a
/// session another replica keeps rewriting.
const MAX_SAVE_ATTEMPTS: u32 = 4;

/// Immutable collaborators shared by every controller built from one config.
#[derive(Clone, Debug)]
pub struct GateParts {
    pub registry: Arc<StageRegistry>,
    pub verifier: Arc<CredentialVerifier>,
    pub lockout: LockoutPolicy,
    pub issuer: AccessTokenIssuer,
    pub session_ttl: Duration,
}

impl GateParts {
    /// Assemble from the loaded config JSON.
    ///
    /// Material is read from `secrets` here, once.
    pub fn from_config_json(
        cfg: &Value,
        secrets: &dyn SecretStore,
        signer: GrantSigner,
    ) -> anyhow::Result<Self> {
        let registry = StageRegistry::from_config_json(cfg).context("stage registry")?;

        let max_per_minute = match cfg.pointer("/verifier/max_verifications_per_minute") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
                Some(n) => Some(n),
                None => bail!("verifier.max_verifications_per_minute must be a u32 (got {v})"),
            },
        };
        let verifier = CredentialVerifier::preload(&registry, secrets, max_per_minute)
            .context("load verification material")?;

        let session_ttl = match cfg.pointer("/gate/session_ttl_secs") {
            None | Some(Value::Null) => DEFAULT_SESSION_TTL,
            Some(v) => match v.as_u64() {
                Some(n) if n > 0 => Duration::from_secs(n),
                _ => bail!("gate.session_ttl_secs must be a positive integer (got {v})"),
            },
        };

        Ok(Self {
            registry: Arc::new(registry),
            verifier: Arc::new(verifier),
            lockout: LockoutPolicy::from_config_json(cfg).context("lockout policy")?,
            issuer: AccessTokenIssuer::from_config_json(cfg, signer).context("grant issuer")?,
            session_ttl,
        })
    }
}

/// What one submit step decided, before persistence and audit.
struct Step {
    outcome: Outcome,
    stage_id: Option<StageId>,
    verification: Option<AttemptResult>,
    /// Lifecycle entries to append after the submit entry.
    lifecycle: Vec<(EntryKind, &'static str)>,
}

impl Step {
    fn refuse(outcome: Outcome) -> Self {
        Self {
            outcome,
            stage_id: None,
            verification: None,
            lifecycle: Vec::new(),
        }
    }
}

pub struct GateController<S> {
    parts: GateParts,
    progress: ProgressTracker,
    store: Arc<S>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    locks: SessionLocks,
}

impl<S: GateStore> GateController<S> {
    pub fn new(parts: GateParts, store: Arc<S>, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            parts,
            progress: ProgressTracker,
            store,
            audit,
            clock,
            locks: SessionLocks::new(),
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.parts.registry
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    // -----------------------------------------------------------------------
    // create_session
    // -----------------------------------------------------------------------

    /// Open a session at stage 0. `context` is stored verbatim.
    pub async fn create_session(&self, subject_id: SubjectId, context: Value) -> GateResult<GateSession> {
        let now = self.clock.now();
        let session = GateSession::new(subject_id, context, now, self.parts.session_ttl);
        self.store
            .insert_session(&session)
            .await
            .map_err(GateError::Store)?;
        self.append(AuditEntry::lifecycle(
            session.session_id.as_uuid(),
            EntryKind::SessionCreated,
            "created",
            now,
        ))
        .await?;

        info!(
            session_id = %session.session_id,
            subject_id = %session.subject_id,
            expires_at = %session.expires_at,
            "gate session created"
        );
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // submit
    // -----------------------------------------------------------------------

    /// Verify one factor for the session's active stage.
    ///
    /// Caller mistakes come back as `Ok(Outcome)`. `Err` means the session
    /// does not exist or a collaborator failed.
    pub async fn submit(&self, session_id: SessionId, factor_id: &FactorId, secret: &str) -> GateResult<Outcome> {
        let _guard = self.locks.acquire(session_id).await;
        let now = self.clock.now();

        let mut attempt = 1;
        let step = loop {
            let mut session = self.load(session_id).await?;
            let before = session.clone();
            let step = self.step(&mut session, factor_id, secret, now).await?;
            if session == before {
                break step;
            }
            match self.store.save_session(&session).await {
                Ok(()) => break step,
                Err(e) => match e.downcast_ref::<SaveRejected>().copied() {
                    Some(SaveRejected::Stale { .. }) if attempt < MAX_SAVE_ATTEMPTS => {
                        debug!(session_id = %session_id, attempt, "concurrent save; retrying submit");
                        attempt += 1;
                    }
                    // Reclaimed by a sweep between load and save.
                    Some(SaveRejected::Missing(_)) if session.is_past_ttl(now) => {
                        break Step::refuse(Outcome::SessionExpired);
                    }
                    Some(SaveRejected::Missing(_)) => return Err(GateError::SessionNotFound(session_id)),
                    _ => return Err(GateError::Store(e)),
                },
            }
        };

        self.append(AuditEntry {
            session_id: session_id.as_uuid(),
            kind: EntryKind::Submit,
            stage_id: step.stage_id.as_ref().map(|s| s.to_string()),
            factor_id: Some(factor_id.to_string()),
            outcome: step.outcome.kind().to_string(),
            verification: step.verification,
            at: now,
        })
        .await?;
        for (kind, outcome) in step.lifecycle {
            self.append(AuditEntry::lifecycle(session_id.as_uuid(), kind, outcome, now))
                .await?;
        }

        Ok(step.outcome)
    }

    async fn step(
        &self,
        session: &mut GateSession,
        factor_id: &FactorId,
        secret: &str,
        now: DateTime<Utc>,
    ) -> GateResult<Step> {
        // 1. Terminal states refuse without side effects.
        match session.state {
            SessionState::Completed => return Ok(Step::refuse(Outcome::SessionAlreadyCompleted)),
            SessionState::Aborted => return Ok(Step::refuse(Outcome::SessionAborted)),
            SessionState::Expired => return Ok(Step::refuse(Outcome::SessionExpired)),
            SessionState::InProgress | SessionState::Locked { .. } => {}
        }

        // 2. Lazy expiry dominates an active lock.
        if session.is_past_ttl(now) {
            session.state = SessionState::Expired;
            info!(session_id = %session.session_id, "gate session expired");
            let mut step = Step::refuse(Outcome::SessionExpired);
            step.lifecycle.push((EntryKind::SessionExpired, "expired"));
            return Ok(step);
        }

        if let SessionState::Locked { until } = session.state {
            if until > now {
                return Ok(Step::refuse(Outcome::SessionLocked {
                    retry_after: remaining(now, until),
                }));
            }
        }

        // 3. Ordering. Refusals from here to verification leave `session`
        // untouched, including a lapsed lock.
        let registry = &self.parts.registry;
        let Some(stage) = registry.owning_stage(factor_id) else {
            return Ok(Step::refuse(Outcome::UnknownFactor));
        };
        let mut step = Step::refuse(Outcome::StageOutOfOrder);
        step.stage_id = Some(stage.id.clone());
        if stage.order != session.current_stage_order {
            return Ok(step);
        }

        // 4. Lockout is consulted before any verification.
        if let LockoutCheck::Blocked { retry_after } = self.parts.lockout.check(session, &stage.id, now) {
            step.outcome = Outcome::SessionLocked { retry_after };
            return Ok(step);
        }

        // 5. Verify.
        let result = match self.parts.verifier.verify(&session.subject_id, factor_id, secret, now) {
            VerifyOutcome::RateLimited { retry_after } => {
                warn!(
                    session_id = %session.session_id,
                    factor_id = %factor_id,
                    retry_after_secs = retry_after.as_secs(),
                    "factor verification budget exhausted"
                );
                step.outcome = Outcome::SessionLocked { retry_after };
                return Ok(step);
            }
            VerifyOutcome::NoMatch => AttemptResult::NoMatch,
            VerifyOutcome::Match => AttemptResult::Match,
        };
        step.verification = Some(result);
        if matches!(session.state, SessionState::Locked { .. }) {
            session.state = SessionState::InProgress;
        }

        if result == AttemptResult::NoMatch {
            let verdict = self.parts.lockout.record_failure(session, &stage.id, now);
            if let Some(retry_after) = verdict.retry_after {
                warn!(
                    session_id = %session.session_id,
                    stage_id = %stage.id,
                    lockouts = session.lockouts,
                    session_locked = verdict.session_locked,
                    retry_after_secs = retry_after.as_secs(),
                    "gate stage locked after repeated failures"
                );
            }
            step.outcome = Outcome::Invalid {
                attempts_remaining: verdict.attempts_remaining,
            };
            return Ok(step);
        }

        // 6. Progress.
        let progress = self.progress.record(session, stage, factor_id, result);
        if !progress.complete {
            step.outcome = Outcome::Advanced { progress };
            return Ok(step);
        }

        if stage.order < registry.last_order() {
            let next_stage = advance_stage(session, stage.order);
            info!(
                session_id = %session.session_id,
                stage_id = %stage.id,
                next_stage,
                "gate stage complete"
            );
            step.outcome = Outcome::StageComplete { next_stage };
            return Ok(step);
        }

        // Last stage: issue before the Completed state is persisted so a
        // failed issuance leaves the session retryable.
        let grant = self
            .parts
            .issuer
            .issue(session, now, self.store.as_ref())
            .await?;
        session.state = SessionState::Completed;
        info!(
            session_id = %session.session_id,
            grant_id = %grant.grant_id,
            expires_at = %grant.expires_at,
            "gate complete; access granted"
        );
        step.outcome = Outcome::GateComplete { grant };
        step.lifecycle.push((EntryKind::GrantIssued, "granted"));
        Ok(step)
    }

    // -----------------------------------------------------------------------
    // get_status
    // -----------------------------------------------------------------------

    /// Read-only view. Lazy transitions are reported, not persisted.
    pub async fn get_status(&self, session_id: SessionId) -> GateResult<GateStatus> {
        let now = self.clock.now();
        let session = self.load(session_id).await?;

        let state = match session.state {
            ref s if s.is_terminal() => s.clone(),
            _ if session.is_past_ttl(now) => SessionState::Expired,
            SessionState::Locked { until } if until <= now => SessionState::InProgress,
            ref s => s.clone(),
        };

        let registry = &self.parts.registry;
        let current_stage = match state {
            SessionState::Completed => None,
            _ => registry
                .stage_at(session.current_stage_order)
                .map(|s| s.id.clone()),
        };
        let per_stage_progress = registry
            .stages()
            .iter()
            .map(|stage| StageStatus {
                stage_id: stage.id.clone(),
                order: stage.order,
                progress: self.progress.progress(&session, stage),
            })
            .collect();

        let grant = match state {
            SessionState::Completed => self
                .store
                .load_grant(session_id)
                .await
                .map_err(GateError::Store)?,
            _ => None,
        };

        Ok(GateStatus {
            session_id,
            state,
            current_stage,
            current_stage_order: session.current_stage_order,
            per_stage_progress,
            expires_at: session.expires_at,
            grant,
        })
    }

    // -----------------------------------------------------------------------
    // resume_session
    // -----------------------------------------------------------------------

    /// Status of the subject's newest unfinished, unexpired session, so a
    /// caller can pick up where it left off instead of starting over.
    pub async fn resume_session(&self, subject_id: &SubjectId) -> GateResult<Option<GateStatus>> {
        let now = self.clock.now();
        let Some(session) = self
            .store
            .find_active_session(subject_id, now)
            .await
            .map_err(GateError::Store)?
        else {
            return Ok(None);
        };
        debug!(session_id = %session.session_id, subject_id = %subject_id, "resuming gate session");
        self.get_status(session.session_id).await.map(Some)
    }

    // -----------------------------------------------------------------------
    // abort
    // -----------------------------------------------------------------------

    /// Abort an active or locked session. Idempotent; terminal sessions are
    /// acknowledged with their current state.
    pub async fn abort(&self, session_id: SessionId) -> GateResult<Ack> {
        let _guard = self.locks.acquire(session_id).await;
        let now = self.clock.now();

        let mut attempt = 1;
        loop {
            let mut session = self.load(session_id).await?;
            let transition = match session.state {
                ref s if s.is_terminal() => None,
                _ if session.is_past_ttl(now) => Some((SessionState::Expired, EntryKind::SessionExpired, "expired")),
                _ => Some((SessionState::Aborted, EntryKind::SessionAborted, "aborted")),
            };
            let Some((state, kind, outcome)) = transition else {
                return Ok(Ack {
                    session_id,
                    state: session.state,
                });
            };

            session.state = state;
            match self.store.save_session(&session).await {
                Ok(()) => {}
                Err(e) => match e.downcast_ref::<SaveRejected>().copied() {
                    Some(SaveRejected::Stale { .. }) if attempt < MAX_SAVE_ATTEMPTS => {
                        debug!(session_id = %session_id, attempt, "concurrent save; retrying abort");
                        attempt += 1;
                        continue;
                    }
                    Some(SaveRejected::Missing(_)) if session.is_past_ttl(now) => {
                        return Ok(Ack {
                            session_id,
                            state: SessionState::Expired,
                        });
                    }
                    Some(SaveRejected::Missing(_)) => return Err(GateError::SessionNotFound(session_id)),
                    _ => return Err(GateError::Store(e)),
                },
            }
            self.append(AuditEntry::lifecycle(session_id.as_uuid(), kind, outcome, now))
                .await?;
            info!(session_id = %session_id, state = session.state.as_str(), "gate session closed");
            return Ok(Ack {
                session_id,
                state: session.state,
            });
        }
    }

    // -----------------------------------------------------------------------
    // sweep
    // -----------------------------------------------------------------------

    /// Reclaim sessions past `expires_at` and idle lock entries.
    ///
    /// Each candidate is deleted under its session lock, so an in-flight
    /// `submit` or `abort` finishes its save first. Correctness never depends
    /// on this running; expiry is checked lazily.
    pub async fn sweep_expired(&self) -> GateResult<usize> {
        let now = self.clock.now();
        let candidates = self
            .store
            .expired_session_ids(now)
            .await
            .map_err(GateError::Store)?;

        let mut reclaimed = 0;
        for id in candidates {
            let _guard = self.locks.acquire(id).await;
            let removed = self
                .store
                .delete_if_expired(id, now)
                .await
                .map_err(GateError::Store)?;
            if !removed {
                continue;
            }
            reclaimed += 1;
            self.append(AuditEntry::lifecycle(
                id.as_uuid(),
                EntryKind::SessionExpired,
                "reclaimed",
                now,
            ))
            .await?;
        }

        let pruned = self.locks.prune();
        if reclaimed > 0 {
            info!(reclaimed, locks_pruned = pruned, "expired gate sessions swept");
        }
        Ok(reclaimed)
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    async fn load(&self, session_id: SessionId) -> GateResult<GateSession> {
        self.store
            .load_session(session_id)
            .await
            .map_err(GateError::Store)?
            .ok_or(GateError::SessionNotFound(session_id))
    }

    async fn append(&self, entry: AuditEntry) -> GateResult<()> {
        self.audit.append(&entry).await.map_err(GateError::Audit)
    }
}

/// Move the session from stage `from` to `from + 1`.
///
/// # Panics
/// If the session is not at `from`. A skip or regression is a gate bug.
fn advance_stage(session: &mut GateSession, from: u32) -> u32 {
    assert_eq!(
        session.current_stage_order, from,
        "stage advance from {from} but session {} is at {}",
        session.session_id, session.current_stage_order
    );
    let next = from.checked_add(1).expect("stage order overflow");
    session.current_stage_order = next;
    next
}
