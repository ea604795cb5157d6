//! Scenario: after-the-fact edits to a chained gate audit log are detected.
//!
//! # Invariants under test
//!
//! 1. Five chained submit entries verify as valid.
//! 2. Rewriting a failed attempt into a success breaks that line's digest.
//! 3. Deleting a line breaks the next line's link.
//! 4. A resumed writer extends the chain without a break.
//! 5. An empty log is trivially valid.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use vg_audit::{verify_hash_chain, AttemptResult, AuditEntry, AuditWriter, EntryKind, VerifyResult};

fn failed_password(session_id: Uuid, i: usize) -> AuditEntry {
    AuditEntry {
        session_id,
        kind: EntryKind::Submit,
        stage_id: Some("admin-passwords".to_string()),
        factor_id: Some(format!("password-{i}")),
        outcome: "invalid".to_string(),
        verification: Some(AttemptResult::NoMatch),
        at: Utc::now(),
    }
}

fn five_failures(dir: &Path) -> PathBuf {
    let path = dir.join("gate-audit.jsonl");
    let session_id = Uuid::new_v4();
    let mut writer = AuditWriter::new(&path, true).unwrap();
    for i in 1..=5 {
        writer.append(&failed_password(session_id, i)).unwrap();
    }
    path
}

fn rewrite_lines(path: &Path, edit: impl FnOnce(&mut Vec<String>)) {
    let content = std::fs::read_to_string(path).unwrap();
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    edit(&mut lines);
    std::fs::write(path, lines.join("\n") + "\n").unwrap();
}

#[test]
fn untouched_chain_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let path = five_failures(dir.path());
    assert_eq!(verify_hash_chain(&path).unwrap(), VerifyResult::Valid { lines: 5 });
}

#[test]
fn forged_success_breaks_the_digest() {
    let dir = tempfile::tempdir().unwrap();
    let path = five_failures(dir.path());

    rewrite_lines(&path, |lines| {
        let mut ev: serde_json::Value = serde_json::from_str(&lines[2]).unwrap();
        ev["entry"]["outcome"] = json!("advanced");
        ev["entry"]["verification"] = json!("match");
        lines[2] = ev.to_string();
    });

    let VerifyResult::Broken { line, reason } = verify_hash_chain(&path).unwrap() else {
        panic!("forged line verified as valid");
    };
    assert_eq!(line, 3);
    assert!(reason.contains("digest mismatch"), "{reason}");
}

#[test]
fn deleted_line_breaks_the_link() {
    let dir = tempfile::tempdir().unwrap();
    let path = five_failures(dir.path());

    rewrite_lines(&path, |lines| {
        lines.remove(2);
    });

    let VerifyResult::Broken { line, reason } = verify_hash_chain(&path).unwrap() else {
        panic!("log with a deleted line verified as valid");
    };
    assert_eq!(line, 3, "the line after the gap carries the stale link");
    assert!(reason.contains("link broken"), "{reason}");
}

#[test]
fn resumed_writer_extends_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = five_failures(dir.path());

    let mut writer = AuditWriter::resume(&path, true).unwrap();
    assert_eq!(writer.seq(), 5);
    writer
        .append(&AuditEntry::lifecycle(Uuid::new_v4(), EntryKind::SessionAborted, "aborted", Utc::now()))
        .unwrap();

    assert_eq!(verify_hash_chain(&path).unwrap(), VerifyResult::Valid { lines: 6 });
}

#[test]
fn empty_log_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.jsonl");
    std::fs::write(&path, "").unwrap();
    assert_eq!(verify_hash_chain(&path).unwrap(), VerifyResult::Valid { lines: 0 });
}
