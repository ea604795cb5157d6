//! Audit sinks consumed by the gate controller.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::{AuditEntry, AuditWriter};

/// Append-only destination for audit entries.
///
/// An `Err` from `append` is surfaced to the caller of the gate operation:
/// an attempt that cannot be recorded is not silently accepted.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<()>;
}

#[async_trait]
impl<T: AuditSink + ?Sized> AuditSink for std::sync::Arc<T> {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        (**self).append(entry).await
    }
}

/// File-backed sink over a hash-chained [`AuditWriter`].
pub struct JsonlAuditSink {
    writer: Mutex<AuditWriter>,
}

impl JsonlAuditSink {
    /// Open (or continue) the JSONL log at `path`.
    pub fn open(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        Ok(Self {
            writer: Mutex::new(AuditWriter::resume(path, hash_chain)?),
        })
    }

    pub fn seq(&self) -> u64 {
        self.writer.lock().map(|w| w.seq()).unwrap_or(0)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut w = self
            .writer
            .lock()
            .map_err(|_| anyhow!("audit writer mutex poisoned"))?;
        w.append(entry)?;
        Ok(())
    }
}

/// In-process audit log. Used by tests and as the daemon's default sink.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far, in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("audit log mutex poisoned"))?
            .push(entry.clone());
        Ok(())
    }
}
