//! Shared runtime state for vg-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Every gate operation
//! goes through the one `GateController` held here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};
use vg_audit::{AuditEntry, AuditSink, JsonlAuditSink};
use vg_config::secrets::ResolvedSecrets;
use vg_db::PgGateStore;
use vg_gate::{
    AccessGrant, Clock, FactorId, GateController, GateParts, GateSession, GrantInsert, GrantSigner,
    GrantStore, MemoryStore, SessionId, SessionStore, StaticSecretStore, SubjectId,
};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Audit(AuditEntry),
    LogLine { level: String, msg: String },
}

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// BusAuditSink
// ---------------------------------------------------------------------------

/// Appends to the durable sink first, then mirrors the entry onto the bus.
///
/// A bus with no subscribers is not an error.
pub struct BusAuditSink {
    inner: Arc<dyn AuditSink>,
    bus: broadcast::Sender<BusMsg>,
}

impl BusAuditSink {
    pub fn new(inner: Arc<dyn AuditSink>, bus: broadcast::Sender<BusMsg>) -> Self {
        Self { inner, bus }
    }
}

#[async_trait]
impl AuditSink for BusAuditSink {
    async fn append(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.inner.append(entry).await?;
        let _ = self.bus.send(BusMsg::Audit(entry.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DaemonStore
// ---------------------------------------------------------------------------

/// Session + grant storage selected at boot.
pub enum DaemonStore {
    Memory(MemoryStore),
    Postgres(PgGateStore),
}

impl DaemonStore {
    pub fn kind(&self) -> &'static str {
        match self {
            DaemonStore::Memory(_) => "memory",
            DaemonStore::Postgres(_) => "postgres",
        }
    }
}

#[async_trait]
impl SessionStore for DaemonStore {
    async fn insert_session(&self, session: &GateSession) -> anyhow::Result<()> {
        match self {
            DaemonStore::Memory(s) => s.insert_session(session).await,
            DaemonStore::Postgres(s) => s.insert_session(session).await,
        }
    }

    async fn load_session(&self, id: SessionId) -> anyhow::Result<Option<GateSession>> {
        match self {
            DaemonStore::Memory(s) => s.load_session(id).await,
            DaemonStore::Postgres(s) => s.load_session(id).await,
        }
    }

    async fn save_session(&self, session: &GateSession) -> anyhow::Result<()> {
        match self {
            DaemonStore::Memory(s) => s.save_session(session).await,
            DaemonStore::Postgres(s) => s.save_session(session).await,
        }
    }

    async fn find_active_session(
        &self,
        subject: &SubjectId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<GateSession>> {
        match self {
            DaemonStore::Memory(s) => s.find_active_session(subject, now).await,
            DaemonStore::Postgres(s) => s.find_active_session(subject, now).await,
        }
    }

    async fn expired_session_ids(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<SessionId>> {
        match self {
            DaemonStore::Memory(s) => s.expired_session_ids(now).await,
            DaemonStore::Postgres(s) => s.expired_session_ids(now).await,
        }
    }

    async fn delete_if_expired(&self, id: SessionId, now: DateTime<Utc>) -> anyhow::Result<bool> {
        match self {
            DaemonStore::Memory(s) => s.delete_if_expired(id, now).await,
            DaemonStore::Postgres(s) => s.delete_if_expired(id, now).await,
        }
    }
}

#[async_trait]
impl GrantStore for DaemonStore {
    async fn insert_grant_if_absent(&self, grant: &AccessGrant) -> anyhow::Result<GrantInsert> {
        match self {
            DaemonStore::Memory(s) => s.insert_grant_if_absent(grant).await,
            DaemonStore::Postgres(s) => s.insert_grant_if_absent(grant).await,
        }
    }

    async fn load_grant(&self, session_id: SessionId) -> anyhow::Result<Option<AccessGrant>> {
        match self {
            DaemonStore::Memory(s) => s.load_grant(session_id).await,
            DaemonStore::Postgres(s) => s.load_grant(session_id).await,
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub gate: Arc<GateController<DaemonStore>>,
    /// Hash of the merged config this process booted with.
    pub config_hash: Option<String>,
}

impl AppState {
    /// Wire the controller. `audit` is wrapped so every entry also reaches
    /// SSE subscribers.
    pub fn new(
        parts: GateParts,
        store: DaemonStore,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        let audit: Arc<dyn AuditSink> = Arc::new(BusAuditSink::new(audit, bus.clone()));
        Self {
            gate: Arc::new(GateController::new(parts, Arc::new(store), audit, clock)),
            bus,
            build: BuildInfo {
                service: "vg-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            config_hash: None,
        }
    }

    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Boot helpers
// ---------------------------------------------------------------------------

/// Gate collaborators from the loaded config and resolved secrets.
pub fn gate_parts_from_config(cfg: &Value, secrets: &ResolvedSecrets) -> anyhow::Result<GateParts> {
    let material: StaticSecretStore = secrets
        .factor_material
        .iter()
        .map(|(factor, m)| (FactorId::new(factor.as_str()), m.clone()))
        .collect();
    let signer = GrantSigner::new(secrets.signing_key.as_bytes().to_vec())?;
    GateParts::from_config_json(cfg, &material, signer)
}

/// `audit.path` set: hash-chained JSONL file (chain on unless
/// `audit.hash_chain: false`). Otherwise `fallback` (the database sink).
///
/// With neither, boot fails: the gate never runs without a durable audit
/// destination.
pub fn audit_sink_from_config(
    cfg: &Value,
    fallback: Option<Arc<dyn AuditSink>>,
) -> anyhow::Result<Arc<dyn AuditSink>> {
    let Some(path) = cfg.pointer("/audit/path").and_then(Value::as_str) else {
        return fallback.context("AUDIT_DESTINATION_REQUIRED: set audit.path or VG_DATABASE_URL");
    };
    let hash_chain = match cfg.pointer("/audit/hash_chain") {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => *b,
        Some(v) => bail!("audit.hash_chain must be a bool (got {v})"),
    };
    let path = PathBuf::from(path);
    let sink = JsonlAuditSink::open(&path, hash_chain)
        .with_context(|| format!("open audit log {}", path.display()))?;
    info!(path = %path.display(), hash_chain, "audit log opened");
    Ok(Arc::new(sink))
}

pub fn sweep_interval_from_config(cfg: &Value) -> anyhow::Result<Duration> {
    match cfg.pointer("/daemon/sweep_interval_secs") {
        None | Some(Value::Null) => Ok(DEFAULT_SWEEP_INTERVAL),
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => Ok(Duration::from_secs(n)),
            _ => bail!("daemon.sweep_interval_secs must be a positive integer (got {v})"),
        },
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Run one expiry sweep and report it on the bus.
pub async fn sweep_once(state: &AppState) -> usize {
    match state.gate.sweep_expired().await {
        Ok(n) => {
            if n > 0 {
                let _ = state.bus.send(BusMsg::LogLine {
                    level: "INFO".to_string(),
                    msg: format!("reclaimed {n} expired gate session(s)"),
                });
            }
            n
        }
        Err(e) => {
            warn!(error = %e, "expiry sweep failed");
            let _ = state.bus.send(BusMsg::LogLine {
                level: "ERROR".to_string(),
                msg: format!("expiry sweep failed: {e}"),
            });
            0
        }
    }
}

/// Spawn the periodic expiry sweep. Expiry is also enforced lazily, so a
/// missed tick only delays reclamation.
pub fn spawn_expiry_sweep(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_once(&state).await;
        }
    });
}
