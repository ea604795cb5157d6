//! Per-stage factor accumulation.

use vg_audit::AttemptResult;

use crate::types::{FactorId, GateSession, Stage, StageProgress};

/// Stateless: all progress lives in the session's `verified_factors`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProgressTracker;

impl ProgressTracker {
    /// Record the result of one factor verification for `stage`.
    ///
    /// Only a `Match` on a factor the stage lists changes anything. Recording
    /// a factor that is already verified is a no-op and returns the unchanged
    /// progress, so a retried call never double-counts.
    pub fn record(
        &self,
        session: &mut GateSession,
        stage: &Stage,
        factor: &FactorId,
        result: AttemptResult,
    ) -> StageProgress {
        if result == AttemptResult::Match && stage.required_factors.contains(factor) {
            session
                .verified_factors
                .entry(stage.id.clone())
                .or_default()
                .insert(factor.clone());
        }
        self.progress(session, stage)
    }

    /// Current progress for `stage` without mutation.
    pub fn progress(&self, session: &GateSession, stage: &Stage) -> StageProgress {
        let verified_count = session
            .verified_factors
            .get(&stage.id)
            .map(|set| set.iter().filter(|f| stage.required_factors.contains(*f)).count())
            .unwrap_or(0) as u32;
        StageProgress {
            verified_count,
            required_count: stage.threshold,
            complete: verified_count >= stage.threshold,
        }
    }
}
