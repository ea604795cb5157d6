//! Per-session exclusive locks.
//!
//! Every mutating operation on a session holds its lock for the whole
//! load-mutate-save cycle. Different sessions never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::types::SessionId;

#[derive(Debug, Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: SessionId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = match self.inner.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            map.entry(id).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Drop entries nobody holds or waits on. Returns the number removed.
    pub fn prune(&self) -> usize {
        let mut map = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let before = map.len();
        map.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_session_serializes() {
        let locks = Arc::new(SessionLocks::new());
        let id = SessionId::new();
        let g = locks.acquire(id).await;

        let l2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.acquire(id).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second acquire must wait");
        drop(g);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_sessions_do_not_contend() {
        let locks = SessionLocks::new();
        let _a = locks.acquire(SessionId::new()).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.acquire(SessionId::new()))
            .await
            .expect("independent session lock");
    }

    #[tokio::test]
    async fn prune_keeps_held_entries() {
        let locks = SessionLocks::new();
        let held = locks.acquire(SessionId::new()).await;
        drop(locks.acquire(SessionId::new()).await);
        assert_eq!(locks.len(), 2);
        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }
}
