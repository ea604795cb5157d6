//! Postgres persistence for the vault gate.
//!
//! `PgGateStore` implements the gate's `SessionStore`, `GrantStore` and
//! `AuditSink`. Grant issuance relies on `insert ... on conflict do nothing`
//! against the `access_grants` primary key. Session saves compare and bump
//! the `revision` column, so replicas sharing the database cannot lose each
//! other's failure counts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;
use vg_audit::{AttemptResult, AuditEntry, AuditSink};
use vg_gate::{
    AccessGrant, GateSession, GrantInsert, GrantStore, SaveRejected, SessionId, SessionStore, SubjectId,
};

pub const ENV_DB_URL: &str = "VG_DATABASE_URL";

/// Connect to Postgres using VG_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_gate_tables: bool,
    pub live_sessions: i64,
}

/// Connectivity + schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (has_gate_tables,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select count(*) = 3
        from information_schema.tables
        where table_schema = 'public'
          and table_name in ('gate_sessions', 'access_grants', 'audit_events')
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    let live_sessions = if has_gate_tables {
        let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
            "select count(*)::bigint from gate_sessions where state in ('in_progress', 'locked')",
        )
        .fetch_one(pool)
        .await
        .context("status live-session count failed")?;
        n
    } else {
        0
    };

    Ok(DbStatus {
        ok: one == 1,
        has_gate_tables,
        live_sessions,
    })
}

// ---------------------------------------------------------------------------
// PgGateStore
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PgGateStore {
    pool: PgPool,
}

impl PgGateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Audit rows for one session, oldest first.
    pub async fn audit_entries_for(&self, session_id: SessionId) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            select session_id, kind, stage_id, factor_id, outcome, verification, at
            from audit_events
            where session_id = $1
            order by at asc, recorded_at asc
            "#,
        )
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .context("audit_entries_for failed")?;

        rows.into_iter()
            .map(|row| -> Result<AuditEntry> {
                let kind: String = row.try_get("kind")?;
                let verification: Option<String> = row.try_get("verification")?;
                Ok(AuditEntry {
                    session_id: row.try_get("session_id")?,
                    kind: serde_json::from_value(Value::String(kind)).context("unknown audit kind")?,
                    stage_id: row.try_get("stage_id")?,
                    factor_id: row.try_get("factor_id")?,
                    outcome: row.try_get("outcome")?,
                    verification: verification
                        .map(|v| serde_json::from_value::<AttemptResult>(Value::String(v)))
                        .transpose()
                        .context("unknown verification result")?,
                    at: row.try_get("at")?,
                })
            })
            .collect()
    }
}

fn session_body(session: &GateSession) -> Result<Value> {
    serde_json::to_value(session).context("serialize gate session")
}

fn revision(r: u64) -> Result<i64> {
    i64::try_from(r).context("session revision out of range")
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<GateSession> {
    let body: Value = row.try_get("body")?;
    serde_json::from_value(body).context("corrupt gate session body")
}

#[async_trait]
impl SessionStore for PgGateStore {
    async fn insert_session(&self, session: &GateSession) -> Result<()> {
        sqlx::query(
            r#"
            insert into gate_sessions (session_id, subject_id, state, body, created_at, expires_at, revision)
            values ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(session.session_id.as_uuid())
        .bind(session.subject_id.as_str())
        .bind(session.state.as_str())
        .bind(session_body(session)?)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(revision(session.revision)?)
        .execute(&self.pool)
        .await
        .context("insert_session failed")?;
        Ok(())
    }

    async fn load_session(&self, id: SessionId) -> Result<Option<GateSession>> {
        let row = sqlx::query("select body from gate_sessions where session_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .context("load_session failed")?;

        row.map(|r| session_from_row(&r).with_context(|| format!("load session {id}")))
            .transpose()
    }

    async fn save_session(&self, session: &GateSession) -> Result<()> {
        let next = GateSession {
            revision: session.revision + 1,
            ..session.clone()
        };
        let res = sqlx::query(
            r#"
            update gate_sessions
            set state = $2, body = $3, expires_at = $4, revision = $6, updated_at = now()
            where session_id = $1 and revision = $5
            "#,
        )
        .bind(session.session_id.as_uuid())
        .bind(next.state.as_str())
        .bind(session_body(&next)?)
        .bind(next.expires_at)
        .bind(revision(session.revision)?)
        .bind(revision(next.revision)?)
        .execute(&self.pool)
        .await
        .context("save_session failed")?;

        if res.rows_affected() == 1 {
            return Ok(());
        }

        let exists = sqlx::query("select 1 from gate_sessions where session_id = $1")
            .bind(session.session_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .context("save_session existence check failed")?
            .is_some();
        let rejected = if exists {
            SaveRejected::Stale {
                session_id: session.session_id,
                revision: session.revision,
            }
        } else {
            SaveRejected::Missing(session.session_id)
        };
        Err(rejected.into())
    }

    async fn find_active_session(&self, subject: &SubjectId, now: DateTime<Utc>) -> Result<Option<GateSession>> {
        let row = sqlx::query(
            r#"
            select body
            from gate_sessions
            where subject_id = $1
              and state in ('in_progress', 'locked')
              and expires_at > $2
            order by created_at desc
            limit 1
            "#,
        )
        .bind(subject.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("find_active_session failed")?;

        row.map(|r| session_from_row(&r)).transpose()
    }

    async fn expired_session_ids(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>> {
        let rows = sqlx::query("select session_id from gate_sessions where expires_at < $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .context("expired_session_ids failed")?;
        rows.into_iter()
            .map(|r| -> Result<SessionId> { Ok(SessionId(r.try_get::<Uuid, _>("session_id")?)) })
            .collect()
    }

    async fn delete_if_expired(&self, id: SessionId, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query("delete from gate_sessions where session_id = $1 and expires_at < $2")
            .bind(id.as_uuid())
            .bind(now)
            .execute(&self.pool)
            .await
            .context("delete_if_expired failed")?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl GrantStore for PgGateStore {
    async fn insert_grant_if_absent(&self, grant: &AccessGrant) -> Result<GrantInsert> {
        let inserted = sqlx::query(
            r#"
            insert into access_grants (
              session_id, grant_id, subject_id, issued_at, expires_at, scope, token
            ) values (
              $1, $2, $3, $4, $5, $6, $7
            )
            on conflict (session_id) do nothing
            returning grant_id
            "#,
        )
        .bind(grant.session_id.as_uuid())
        .bind(grant.grant_id)
        .bind(grant.subject_id.as_str())
        .bind(grant.issued_at)
        .bind(grant.expires_at)
        .bind(&grant.scope)
        .bind(&grant.token)
        .fetch_optional(&self.pool)
        .await
        .context("insert_grant_if_absent failed")?;

        Ok(match inserted {
            Some(_) => GrantInsert::Inserted,
            None => GrantInsert::Conflict,
        })
    }

    async fn load_grant(&self, session_id: SessionId) -> Result<Option<AccessGrant>> {
        let row = sqlx::query(
            r#"
            select grant_id, subject_id, issued_at, expires_at, scope, token
            from access_grants
            where session_id = $1
            "#,
        )
        .bind(session_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .context("load_grant failed")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(AccessGrant {
            grant_id: row.try_get("grant_id")?,
            session_id,
            subject_id: SubjectId::new(row.try_get::<String, _>("subject_id")?),
            issued_at: row.try_get("issued_at")?,
            expires_at: row.try_get("expires_at")?,
            scope: row.try_get("scope")?,
            token: row.try_get("token")?,
        }))
    }
}

#[async_trait]
impl AuditSink for PgGateStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let verification = entry.verification.map(|v| match v {
            AttemptResult::Match => "match",
            AttemptResult::NoMatch => "no_match",
        });
        let kind = serde_json::to_value(entry.kind).context("serialize audit kind")?;

        sqlx::query(
            r#"
            insert into audit_events (
              event_id, session_id, kind, stage_id, factor_id, outcome, verification, at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8
            )
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.session_id)
        .bind(kind.as_str().unwrap_or_default())
        .bind(&entry.stage_id)
        .bind(&entry.factor_id)
        .bind(&entry.outcome)
        .bind(verification)
        .bind(entry.at)
        .execute(&self.pool)
        .await
        .context("insert audit event failed")?;
        Ok(())
    }
}
