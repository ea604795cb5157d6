//! vg-audit
//!
//! Append-only audit trail for the vault gate.
//!
//! - `AuditWriter` writes JSON Lines (one event per line) with canonical key
//!   order and an optional SHA-256 hash chain (`hash_prev` + `hash_self`).
//! - `verify_hash_chain` detects edited, deleted or reordered lines.
//! - `AuditSink` is the async seam the gate controller appends through.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

mod entry;
mod sink;

pub use entry::{AttemptResult, AuditEntry, EntryKind, FactorAttempt};
pub use sink::{AuditSink, JsonlAuditSink, MemoryAuditLog};

/// Namespace for deterministic event ids.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b9e_4a57_4d0e_9c3a_1e7b_55d2_a0c4);

/// Where the next event attaches: its `seq` and the `hash_self` it links to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ChainHead {
    seq: u64,
    last_hash: Option<String>,
}

/// Append-only JSONL writer for [`AuditEntry`] records.
pub struct AuditWriter {
    path: PathBuf,
    hash_chain: bool,
    head: ChainHead,
}

impl AuditWriter {
    /// Start a fresh log at `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create audit dir {}", dir.display()))?;
        }
        Ok(Self {
            path,
            hash_chain,
            head: ChainHead::default(),
        })
    }

    /// Continue an existing log after a restart.
    ///
    /// The head is rebuilt from the last event on disk, so new lines link to
    /// the old ones. A missing file starts fresh.
    pub fn resume(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let mut w = Self::new(path, hash_chain)?;
        if w.path.exists() {
            let content = fs::read_to_string(&w.path)
                .with_context(|| format!("read audit log {}", w.path.display()))?;
            for parsed in events(&content) {
                let (_, ev) = parsed?;
                w.head = ChainHead {
                    seq: ev.seq + 1,
                    last_hash: ev.hash_self,
                };
            }
        }
        Ok(w)
    }

    /// Events appended so far; the next event gets this `seq`.
    pub fn seq(&self) -> u64 {
        self.head.seq
    }

    pub fn last_hash(&self) -> Option<String> {
        self.head.last_hash.clone()
    }

    /// Append one entry and return the line as written.
    pub fn append(&mut self, entry: &AuditEntry) -> Result<AuditEvent> {
        let payload = serde_json::to_value(entry).context("serialize audit entry")?;
        let mut ev = AuditEvent {
            event_id: event_id(&self.head, &payload)?,
            seq: self.head.seq,
            written_at: Utc::now(),
            entry: entry.clone(),
            hash_prev: None,
            hash_self: None,
        };
        if self.hash_chain {
            ev.hash_prev = self.head.last_hash.clone();
            ev.hash_self = Some(event_hash(&ev)?);
        }

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        writeln!(f, "{}", canonical(&ev)?).context("write audit line")?;

        self.head = ChainHead {
            seq: ev.seq + 1,
            last_hash: if self.hash_chain { ev.hash_self.clone() } else { None },
        };
        Ok(ev)
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub seq: u64,
    pub written_at: DateTime<Utc>,
    pub entry: AuditEntry,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// UUIDv5 over (chain position, canonical payload). Replaying the same entry
/// at the same position reproduces the id.
fn event_id(head: &ChainHead, payload: &Value) -> Result<Uuid> {
    let name = format!(
        "{}|{}|{}",
        head.last_hash.as_deref().unwrap_or("GENESIS"),
        head.seq,
        canonical(payload)?
    );
    Ok(Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes()))
}

/// SHA-256 of the event's canonical JSON with `hash_self` cleared.
pub fn event_hash(ev: &AuditEvent) -> Result<String> {
    let unsealed = AuditEvent {
        hash_self: None,
        ..ev.clone()
    };
    Ok(hex::encode(Sha256::digest(canonical(&unsealed)?.as_bytes())))
}

/// Compact JSON with object keys sorted at every depth.
fn canonical<T: Serialize + ?Sized>(v: &T) -> Result<String> {
    fn sorted(v: Value) -> Value {
        match v {
            Value::Object(map) => {
                let ordered: BTreeMap<String, Value> =
                    map.into_iter().map(|(k, v)| (k, sorted(v))).collect();
                Value::Object(ordered.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
            other => other,
        }
    }
    let raw = serde_json::to_value(v).context("serialize for canonical json")?;
    serde_json::to_string(&sorted(raw)).context("canonical json")
}

/// Non-empty lines parsed as events, with 1-based line numbers.
fn events(content: &str) -> impl Iterator<Item = Result<(usize, AuditEvent)>> + '_ {
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str::<AuditEvent>(l.trim())
                .map(|ev| (i + 1, ev))
                .with_context(|| format!("parse audit event at line {}", i + 1))
        })
}

/// Verify the hash chain of the log at `path`.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("read audit log {}", path.display()))?;
    verify_hash_chain_str(&content)
}

/// Same as [`verify_hash_chain`] over in-memory JSONL content.
///
/// Every event must link to the previous event's `hash_self`, and a present
/// `hash_self` must match the recomputed digest.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut expected_prev: Option<String> = None;
    let mut lines = 0usize;

    for parsed in events(content) {
        let (line, ev) = parsed?;
        lines += 1;

        if ev.hash_prev != expected_prev {
            return Ok(VerifyResult::Broken {
                line,
                reason: format!(
                    "link broken: expected hash_prev {:?}, found {:?}",
                    expected_prev, ev.hash_prev
                ),
            });
        }
        if let Some(claimed) = &ev.hash_self {
            let actual = event_hash(&ev)?;
            if *claimed != actual {
                return Ok(VerifyResult::Broken {
                    line,
                    reason: format!("digest mismatch: line claims {claimed}, content hashes to {actual}"),
                });
            }
        }
        expected_prev = ev.hash_self;
    }

    Ok(VerifyResult::Valid { lines })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    /// First bad line (1-based) and why.
    Broken { line: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(outcome: &str) -> AuditEntry {
        AuditEntry::lifecycle(Uuid::nil(), EntryKind::Submit, outcome, Utc::now())
    }

    #[test]
    fn event_id_ignores_key_order_but_not_position() {
        let head = ChainHead {
            seq: 4,
            last_hash: Some("abc".into()),
        };
        let a = event_id(&head, &serde_json::json!({"b": 1, "a": 2})).unwrap();
        let b = event_id(&head, &serde_json::json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);

        let later = ChainHead { seq: 5, ..head };
        assert_ne!(a, event_id(&later, &serde_json::json!({"a": 2, "b": 1})).unwrap());
    }

    #[test]
    fn unchained_log_has_no_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.jsonl");
        let mut w = AuditWriter::new(&path, false).unwrap();
        let ev = w.append(&entry("invalid")).unwrap();
        assert!(ev.hash_prev.is_none() && ev.hash_self.is_none());
        assert_eq!(w.seq(), 1);
        assert_eq!(verify_hash_chain(&path).unwrap(), VerifyResult::Valid { lines: 1 });
    }

    #[test]
    fn resume_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let mut w = AuditWriter::new(&path, true).unwrap();
            w.append(&entry("advanced")).unwrap();
            w.append(&entry("invalid")).unwrap();
        }
        let mut w = AuditWriter::resume(&path, true).unwrap();
        assert_eq!(w.seq(), 2);
        assert!(w.last_hash().is_some());
        let ev = w.append(&entry("stage_complete")).unwrap();
        assert_eq!(ev.seq, 2);

        assert_eq!(verify_hash_chain(&path).unwrap(), VerifyResult::Valid { lines: 3 });
    }
}
