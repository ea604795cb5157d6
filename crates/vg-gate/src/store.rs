//! Persistence seams and the in-memory arena store.
//!
//! Sessions and grants are owned by the store, keyed by `session_id`. The
//! controller loads, mutates and saves a session within one operation and
//! never caches it.
//!
//! `save_session` is a compare-and-swap on `GateSession::revision`, so two
//! controllers over one store cannot silently overwrite each other.
//! `insert_grant_if_absent` guarantees at most one grant per session.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{AccessGrant, GateSession, SessionId, SubjectId};

/// Why a `save_session` wrote nothing.
///
/// Stores return this inside the `anyhow::Error` so the controller can
/// `downcast_ref` it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveRejected {
    /// The row is gone (reclaimed by a sweep on another replica).
    Missing(SessionId),
    /// Another writer saved since this copy was loaded.
    Stale { session_id: SessionId, revision: u64 },
}

impl std::fmt::Display for SaveRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveRejected::Missing(id) => write!(f, "save of unknown session {id}"),
            SaveRejected::Stale { session_id, revision } => {
                write!(f, "stale save of session {session_id} at revision {revision}")
            }
        }
    }
}

impl std::error::Error for SaveRejected {}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a freshly created session. Fails if the id already exists.
    async fn insert_session(&self, session: &GateSession) -> Result<()>;

    async fn load_session(&self, id: SessionId) -> Result<Option<GateSession>>;

    /// Overwrite the stored session if its revision still equals
    /// `session.revision`, storing `revision + 1`. Otherwise fails with
    /// [`SaveRejected`].
    async fn save_session(&self, session: &GateSession) -> Result<()>;

    /// Most recently created session of `subject` that is neither terminal
    /// nor past `expires_at` at `now`.
    async fn find_active_session(&self, subject: &SubjectId, now: DateTime<Utc>) -> Result<Option<GateSession>>;

    /// Ids of sessions whose `expires_at` is before `now`.
    async fn expired_session_ids(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>>;

    /// Remove `id` if it is still past `expires_at` at `now`. Returns whether
    /// a row was removed.
    async fn delete_if_expired(&self, id: SessionId, now: DateTime<Utc>) -> Result<bool>;
}

/// Result of an atomic grant insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrantInsert {
    /// This call created the grant.
    Inserted,
    /// A grant for the session already existed; nothing was written.
    Conflict,
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Atomic insert-if-absent keyed by `grant.session_id`.
    async fn insert_grant_if_absent(&self, grant: &AccessGrant) -> Result<GrantInsert>;

    async fn load_grant(&self, session_id: SessionId) -> Result<Option<AccessGrant>>;
}

/// Everything the controller needs from persistence.
pub trait GateStore: SessionStore + GrantStore {}

impl<T: SessionStore + GrantStore> GateStore for T {}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Arena of sessions and grants indexed by `session_id`.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, GateSession>>,
    grants: Mutex<HashMap<SessionId, AccessGrant>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).map(|m| m.len()).unwrap_or(0)
    }

    pub fn grant_count(&self) -> usize {
        lock(&self.grants).map(|m| m.len()).unwrap_or(0)
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow!("memory store mutex poisoned"))
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &GateSession) -> Result<()> {
        let mut m = lock(&self.sessions)?;
        if m.contains_key(&session.session_id) {
            bail!("session {} already exists", session.session_id);
        }
        m.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn load_session(&self, id: SessionId) -> Result<Option<GateSession>> {
        Ok(lock(&self.sessions)?.get(&id).cloned())
    }

    async fn save_session(&self, session: &GateSession) -> Result<()> {
        let mut m = lock(&self.sessions)?;
        let Some(slot) = m.get_mut(&session.session_id) else {
            return Err(SaveRejected::Missing(session.session_id).into());
        };
        if slot.revision != session.revision {
            return Err(SaveRejected::Stale {
                session_id: session.session_id,
                revision: session.revision,
            }
            .into());
        }
        *slot = GateSession {
            revision: session.revision + 1,
            ..session.clone()
        };
        Ok(())
    }

    async fn find_active_session(&self, subject: &SubjectId, now: DateTime<Utc>) -> Result<Option<GateSession>> {
        let m = lock(&self.sessions)?;
        Ok(m.values()
            .filter(|s| &s.subject_id == subject && !s.state.is_terminal() && s.expires_at > now)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn expired_session_ids(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>> {
        let m = lock(&self.sessions)?;
        Ok(m.values()
            .filter(|s| s.expires_at < now)
            .map(|s| s.session_id)
            .collect())
    }

    async fn delete_if_expired(&self, id: SessionId, now: DateTime<Utc>) -> Result<bool> {
        let mut m = lock(&self.sessions)?;
        match m.get(&id) {
            Some(s) if s.expires_at < now => Ok(m.remove(&id).is_some()),
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl GrantStore for MemoryStore {
    async fn insert_grant_if_absent(&self, grant: &AccessGrant) -> Result<GrantInsert> {
        let mut m = lock(&self.grants)?;
        match m.entry(grant.session_id) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(GrantInsert::Conflict),
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(grant.clone());
                Ok(GrantInsert::Inserted)
            }
        }
    }

    async fn load_grant(&self, session_id: SessionId) -> Result<Option<AccessGrant>> {
        Ok(lock(&self.grants)?.get(&session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionState;
    use std::time::Duration;
    use uuid::Uuid;

    fn session(now: DateTime<Utc>, ttl_secs: u64) -> GateSession {
        GateSession::new(
            SubjectId::new("admin"),
            serde_json::json!({"origin": "127.0.0.1"}),
            now,
            Duration::from_secs(ttl_secs),
        )
    }

    fn grant(session_id: SessionId) -> AccessGrant {
        let now = Utc::now();
        AccessGrant {
            grant_id: Uuid::new_v4(),
            session_id,
            subject_id: SubjectId::new("admin"),
            issued_at: now,
            expires_at: now,
            scope: vec!["vault:admin".into()],
            token: "t".into(),
        }
    }

    #[tokio::test]
    async fn insert_load_save_roundtrip() {
        let st = MemoryStore::new();
        let mut s = session(Utc::now(), 60);
        st.insert_session(&s).await.unwrap();
        assert!(st.insert_session(&s).await.is_err(), "duplicate insert must fail");

        s.current_stage_order = 1;
        st.save_session(&s).await.unwrap();
        let stored = st.load_session(s.session_id).await.unwrap().unwrap();
        assert_eq!(stored.current_stage_order, 1);
        assert_eq!(stored.revision, 1);
        assert_eq!(stored, GateSession { revision: 1, ..s });
        assert!(st.load_session(SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_of_unknown_session_is_missing() {
        let st = MemoryStore::new();
        let s = session(Utc::now(), 60);
        let err = st.save_session(&s).await.unwrap_err();
        assert_eq!(err.downcast_ref::<SaveRejected>(), Some(&SaveRejected::Missing(s.session_id)));
    }

    #[tokio::test]
    async fn second_writer_from_same_revision_is_stale() {
        let st = MemoryStore::new();
        let s = session(Utc::now(), 60);
        st.insert_session(&s).await.unwrap();

        let mut a = st.load_session(s.session_id).await.unwrap().unwrap();
        let mut b = a.clone();
        a.fail_counts.insert("context-check".into(), 1);
        b.fail_counts.insert("context-check".into(), 1);
        st.save_session(&a).await.unwrap();

        let err = st.save_session(&b).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<SaveRejected>(), Some(SaveRejected::Stale { revision: 0, .. })));

        // Reload and reapply: the increment lands on top of the first one.
        let mut b = st.load_session(s.session_id).await.unwrap().unwrap();
        *b.fail_counts.entry("context-check".into()).or_default() += 1;
        st.save_session(&b).await.unwrap();
        let stored = st.load_session(s.session_id).await.unwrap().unwrap();
        assert_eq!(stored.fail_counts[&crate::types::StageId::from("context-check")], 2);
        assert_eq!(stored.revision, 2);
    }

    #[tokio::test]
    async fn active_session_is_latest_live_one_for_subject() {
        let st = MemoryStore::new();
        let now = Utc::now();
        let admin = SubjectId::new("admin");

        let older = session(now, 600);
        let mut newer = session(now + chrono::Duration::seconds(5), 600);
        st.insert_session(&older).await.unwrap();
        st.insert_session(&newer).await.unwrap();
        st.insert_session(&GateSession::new(
            SubjectId::new("someone-else"),
            serde_json::Value::Null,
            now + chrono::Duration::seconds(9),
            Duration::from_secs(600),
        ))
        .await
        .unwrap();

        let found = st.find_active_session(&admin, now).await.unwrap().unwrap();
        assert_eq!(found.session_id, newer.session_id);

        newer.state = SessionState::Aborted;
        st.save_session(&newer).await.unwrap();
        let found = st.find_active_session(&admin, now).await.unwrap().unwrap();
        assert_eq!(found.session_id, older.session_id);

        let past_ttl = now + chrono::Duration::seconds(601);
        assert!(st.find_active_session(&admin, past_ttl).await.unwrap().is_none());
        assert!(st
            .find_active_session(&SubjectId::new("nobody"), now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn grant_insert_is_first_writer_wins() {
        let st = MemoryStore::new();
        let sid = SessionId::new();
        let first = grant(sid);
        assert_eq!(st.insert_grant_if_absent(&first).await.unwrap(), GrantInsert::Inserted);
        assert_eq!(st.insert_grant_if_absent(&grant(sid)).await.unwrap(), GrantInsert::Conflict);
        assert_eq!(st.load_grant(sid).await.unwrap().unwrap(), first);
        assert_eq!(st.grant_count(), 1);
    }

    #[tokio::test]
    async fn expiry_deletes_only_past_ttl() {
        let st = MemoryStore::new();
        let now = Utc::now();
        let short = session(now, 10);
        let long = session(now, 1000);
        st.insert_session(&short).await.unwrap();
        st.insert_session(&long).await.unwrap();

        let later = now + chrono::Duration::seconds(11);
        assert_eq!(st.expired_session_ids(later).await.unwrap(), vec![short.session_id]);
        assert!(!st.delete_if_expired(long.session_id, later).await.unwrap());
        assert!(st.delete_if_expired(short.session_id, later).await.unwrap());
        assert!(!st.delete_if_expired(short.session_id, later).await.unwrap());
        assert_eq!(st.session_count(), 1);
    }
}
