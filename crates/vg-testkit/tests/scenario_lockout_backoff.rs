//! Scenario: repeated failures lock the stage, then the session.
//!
//! # Invariants under test
//!
//! 1. Three wrong admin passwords return `Invalid` with 2, 1, 0 attempts
//!    remaining; the next attempt inside the window is `SessionLocked` with
//!    a 30s retry and never reaches the verifier.
//! 2. Successive `retry_after` values for one (session, stage) never shrink.
//! 3. Reaching the session lockout limit locks the whole session for the
//!    session lock window, and TTL expiry still wins over that lock.
//! 4. The global per-factor verification budget refuses across sessions.

use std::sync::Arc;
use std::time::Duration;

use vg_gate::{CredentialVerifier, LockoutPolicy, MemoryStore, Outcome, SessionState};
use vg_testkit::{epoch, vault_parts, vault_secrets, Harness, ManualClock, PASSWORD_FACTORS};

#[tokio::test]
async fn third_failure_locks_for_base_backoff_without_verifying() {
    let h = Harness::new();
    let s = h.open().await.unwrap();
    h.pass_stage(s, 0).await.unwrap();
    h.pass_stage(s, 1).await.unwrap();

    let pw = PASSWORD_FACTORS[0];
    for remaining in [2, 1, 0] {
        assert_eq!(
            h.submit(s, pw, "letmein").await.unwrap(),
            Outcome::Invalid {
                attempts_remaining: remaining
            }
        );
    }

    let audited = h.audit.len();
    for _ in 0..2 {
        assert_eq!(
            h.submit_correct(s, pw).await.unwrap(),
            Outcome::SessionLocked {
                retry_after: Duration::from_secs(30)
            }
        );
    }
    let refused = &h.audit.entries()[audited..];
    assert_eq!(refused.len(), 2);
    assert!(refused.iter().all(|e| e.verification.is_none()));
    assert!(refused.iter().all(|e| e.outcome == "session_locked"));

    // Window elapses; the correct password is accepted again.
    h.advance(Duration::from_secs(30));
    let out = h.submit_correct(s, pw).await.unwrap();
    assert!(matches!(out, Outcome::Advanced { .. }), "got {out:?}");
}

#[tokio::test]
async fn retry_after_never_shrinks() {
    let h = Harness::with_lockout(LockoutPolicy {
        failure_threshold: 3,
        base_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(8),
        session_lockout_limit: 0,
        session_lock: Duration::from_secs(60),
    });
    let s = h.open().await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..9 {
        let out = h.submit(s, "ctx", "origin:10.0.0.1").await.unwrap();
        assert!(matches!(out, Outcome::Invalid { .. }), "got {out:?}");

        let locked = h.snapshot(s).await.unwrap().unwrap().state;
        if matches!(locked, SessionState::Locked { .. }) {
            match h.submit(s, "ctx", "x").await.unwrap() {
                Outcome::SessionLocked { retry_after } => {
                    seen.push(retry_after);
                    h.advance(retry_after);
                }
                other => panic!("expected SessionLocked, got {other:?}"),
            }
        }
    }

    assert_eq!(
        seen,
        [1, 2, 4, 8, 8, 8, 8].map(Duration::from_secs).to_vec()
    );
    assert!(seen.windows(2).all(|w| w[1] >= w[0]));
}

#[tokio::test]
async fn session_lock_escalates_and_expiry_still_wins() {
    let h = Harness::new();
    let s = h.open().await.unwrap();

    // Lockouts 1 and 2: stage backoff only.
    for _ in 0..3 {
        h.submit(s, "ctx", "bad").await.unwrap();
    }
    h.advance(Duration::from_secs(30));
    h.submit(s, "ctx", "bad").await.unwrap();
    h.advance(Duration::from_secs(60));

    // Lockout 3 reaches the session limit.
    assert_eq!(
        h.submit(s, "ctx", "bad").await.unwrap(),
        Outcome::Invalid {
            attempts_remaining: 0
        }
    );
    let session = h.snapshot(s).await.unwrap().unwrap();
    assert_eq!(session.lockouts, 3);
    assert!(matches!(session.state, SessionState::Locked { .. }));
    assert_eq!(
        h.submit_correct(s, "ctx").await.unwrap(),
        Outcome::SessionLocked {
            retry_after: Duration::from_secs(900)
        }
    );

    // The 600s TTL runs out before the 900s lock.
    h.advance(Duration::from_secs(600));
    assert_eq!(h.submit_correct(s, "ctx").await.unwrap(), Outcome::SessionExpired);
    assert_eq!(
        h.snapshot(s).await.unwrap().unwrap().state,
        SessionState::Expired
    );
}

#[tokio::test]
async fn verification_budget_is_shared_across_sessions() {
    let mut parts = vault_parts(LockoutPolicy::default());
    parts.verifier = Arc::new(
        CredentialVerifier::preload(&parts.registry, &vault_secrets(), Some(2)).unwrap(),
    );
    let h = Harness::sharing(Arc::new(MemoryStore::new()), parts, ManualClock::new(epoch()));

    let a = h.open().await.unwrap();
    let b = h.open().await.unwrap();
    h.submit(a, "ctx", "bad").await.unwrap();
    h.submit(a, "ctx", "bad").await.unwrap();

    assert_eq!(
        h.submit_correct(b, "ctx").await.unwrap(),
        Outcome::SessionLocked {
            retry_after: Duration::from_secs(60)
        }
    );
    // Budget refusals are not failures.
    assert!(h.snapshot(b).await.unwrap().unwrap().fail_counts.is_empty());

    h.advance(Duration::from_secs(60));
    assert_eq!(
        h.submit_correct(b, "ctx").await.unwrap(),
        Outcome::StageComplete { next_stage: 1 }
    );
}
