//! Scenario: two completing submits race on one session.
//!
//! # Invariants under test
//!
//! 1. Within one controller the per-session lock serializes the race: one
//!    caller gets `GateComplete`, the other `SessionAlreadyCompleted`.
//! 2. Two controllers over the same store (no shared lock map, as with two
//!    daemon replicas) still leave exactly one grant in storage, and every
//!    `GateComplete` they return carries that same grant.
//! 3. Concurrent failed submits on two controllers are all counted: a save
//!    from a stale copy is retried, never silently overwritten.

use std::sync::Arc;

use vg_gate::{GrantStore, LockoutPolicy, Outcome, SessionId, StageId};
use vg_testkit::{vault_parts, Harness, PASSWORD_FACTORS};

async fn to_last_factor(h: &Harness) -> SessionId {
    let s = h.open().await.unwrap();
    h.pass_stage(s, 0).await.unwrap();
    h.pass_stage(s, 1).await.unwrap();
    for f in PASSWORD_FACTORS.iter().take(3) {
        h.submit_correct(s, f).await.unwrap();
    }
    s
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_controller_serializes_completion() {
    let h = Arc::new(Harness::new());
    let s = to_last_factor(&h).await;

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.submit_correct(s, PASSWORD_FACTORS[3]).await })
        })
        .collect();
    let mut outcomes = Vec::new();
    for t in tasks {
        outcomes.push(t.await.unwrap().unwrap());
    }

    let complete = outcomes
        .iter()
        .filter(|o| matches!(o, Outcome::GateComplete { .. }))
        .count();
    assert_eq!(complete, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.contains(&Outcome::SessionAlreadyCompleted));
    assert_eq!(h.store.grant_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_controllers_share_one_grant() {
    for _ in 0..16 {
        let a = Arc::new(Harness::new());
        let b = Arc::new(Harness::sharing(
            a.store.clone(),
            vault_parts(LockoutPolicy::default()),
            a.clock.clone(),
        ));
        let s = to_last_factor(&a).await;

        let ta = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.submit_correct(s, PASSWORD_FACTORS[3]).await })
        };
        let tb = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.submit_correct(s, PASSWORD_FACTORS[3]).await })
        };
        let outcomes = [ta.await.unwrap().unwrap(), tb.await.unwrap().unwrap()];

        assert_eq!(a.store.grant_count(), 1);
        let stored = a.store.load_grant(s).await.unwrap().unwrap();
        let mut granted = 0;
        for o in &outcomes {
            match o {
                Outcome::GateComplete { grant } => {
                    assert_eq!(grant, &stored);
                    granted += 1;
                }
                Outcome::SessionAlreadyCompleted => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert!(granted >= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replica_failures_are_never_lost() {
    for _ in 0..16 {
        let a = Arc::new(Harness::new());
        let b = Arc::new(Harness::sharing(
            a.store.clone(),
            vault_parts(LockoutPolicy::default()),
            a.clock.clone(),
        ));
        let s = a.open().await.unwrap();

        let tasks: Vec<_> = [Arc::clone(&a), Arc::clone(&b)]
            .into_iter()
            .map(|h| tokio::spawn(async move { h.submit(s, "ctx", "wrong-origin").await }))
            .collect();
        for t in tasks {
            assert!(matches!(t.await.unwrap().unwrap(), Outcome::Invalid { .. }));
        }

        let stored = a.snapshot(s).await.unwrap().unwrap();
        assert_eq!(stored.fail_counts.get(&StageId::new("context-check")), Some(&2));
        assert_eq!(stored.revision, 2);
    }
}
