//! In-memory session repository
//!
//! Same contract as the SQL-backed repository, without a database. A
//! transaction takes an exclusive lock on the map and works on a staged copy;
//! commit publishes the copy, drop or rollback throws it away. Transactions
//! are therefore fully serialized.
//!
//! [`FaultPlan`] lets tests make individual steps fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::session::{RepositoryError, SessionRepository, SessionTransaction};
use crate::models::Session;
use crate::services::token::SessionDigest;

type SessionMap = HashMap<SessionDigest, Session>;

/// Switches that make the next matching storage step fail
#[derive(Debug, Default)]
pub struct FaultPlan {
    begin: AtomicBool,
    commit: AtomicBool,
    insert: AtomicBool,
    find: AtomicBool,
    update: AtomicBool,
    delete: AtomicBool,
}

impl FaultPlan {
    pub fn fail_begin(&self, fail: bool) {
        self.begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_insert(&self, fail: bool) {
        self.insert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_find(&self, fail: bool) {
        self.find.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update(&self, fail: bool) {
        self.update.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.delete.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, step: &'static str) -> Result<(), anyhow::Error> {
        if flag.load(Ordering::SeqCst) {
            Err(anyhow::anyhow!("injected {} failure", step))
        } else {
            Ok(())
        }
    }
}

/// Session repository backed by a `HashMap`
#[derive(Clone, Default)]
pub struct MemorySessionRepository {
    sessions: Arc<Mutex<SessionMap>>,
    faults: Arc<FaultPlan>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed() -> Arc<dyn SessionRepository> {
        Arc::new(Self::new())
    }

    /// Fault switches shared by every transaction of this repository
    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Committed copy of a session, if any
    pub async fn get(&self, id: &SessionDigest) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Number of committed sessions
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn begin(&self) -> Result<Box<dyn SessionTransaction>, RepositoryError> {
        FaultPlan::check(&self.faults.begin, "begin").map_err(RepositoryError::Transaction)?;

        let guard = self.sessions.clone().lock_owned().await;
        let staged = guard.clone();

        Ok(Box::new(MemorySessionTransaction {
            guard,
            staged,
            faults: self.faults.clone(),
        }))
    }
}

/// Open transaction over a [`MemorySessionRepository`]
pub struct MemorySessionTransaction {
    guard: OwnedMutexGuard<SessionMap>,
    staged: SessionMap,
    faults: Arc<FaultPlan>,
}

impl MemorySessionTransaction {
    fn check(&self, flag: &AtomicBool, step: &'static str) -> Result<(), RepositoryError> {
        FaultPlan::check(flag, step).map_err(RepositoryError::Persistence)
    }
}

#[async_trait]
impl SessionTransaction for MemorySessionTransaction {
    async fn insert(&mut self, session: &Session) -> Result<(), RepositoryError> {
        self.check(&self.faults.insert, "insert")?;

        if self.staged.contains_key(&session.id) {
            return Err(RepositoryError::DuplicateSession);
        }
        self.staged.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_by_digest(&mut self, id: &SessionDigest) -> Result<Session, RepositoryError> {
        self.check(&self.faults.find, "find")?;

        self.staged.get(id).cloned().ok_or(RepositoryError::NotFound)
    }

    async fn update_expiry(
        &mut self,
        id: &SessionDigest,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.check(&self.faults.update, "update")?;

        match self.staged.get_mut(id) {
            Some(session) => {
                session.expires_at = expires_at;
                Ok(())
            }
            None => Err(RepositoryError::Persistence(anyhow::anyhow!(
                "No session row {} to update",
                id.short()
            ))),
        }
    }

    async fn delete_by_digest(&mut self, id: &SessionDigest) -> Result<(), RepositoryError> {
        self.check(&self.faults.delete, "delete")?;

        self.staged.remove(id);
        Ok(())
    }

    async fn delete_by_user(&mut self, user_id: i64) -> Result<u64, RepositoryError> {
        self.check(&self.faults.delete, "delete")?;

        let before = self.staged.len();
        self.staged.retain(|_, session| session.user_id != user_id);
        Ok((before - self.staged.len()) as u64)
    }

    async fn delete_expired(&mut self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        self.check(&self.faults.delete, "delete")?;

        let before = self.staged.len();
        self.staged.retain(|_, session| session.expires_at >= now);
        Ok((before - self.staged.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        FaultPlan::check(&self.faults.commit, "commit").map_err(RepositoryError::Transaction)?;

        let MemorySessionTransaction {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::token::digest;
    use chrono::Duration;

    fn session(token: &str, user_id: i64, expires_in: Duration) -> Session {
        Session {
            id: digest(token),
            user_id,
            expires_at: Utc::now() + expires_in,
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_changes() {
        let repo = MemorySessionRepository::new();
        let s = session("a", 1, Duration::days(1));

        let mut tx = repo.begin().await.unwrap();
        tx.insert(&s).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(repo.get(&s.id).await, Some(s));
    }

    #[tokio::test]
    async fn test_drop_discards_changes() {
        let repo = MemorySessionRepository::new();
        let s = session("a", 1, Duration::days(1));

        {
            let mut tx = repo.begin().await.unwrap();
            tx.insert(&s).await.unwrap();
        }

        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_commit_discards_changes() {
        let repo = MemorySessionRepository::new();
        repo.faults().fail_commit(true);

        let mut tx = repo.begin().await.unwrap();
        tx.insert(&session("a", 1, Duration::days(1))).await.unwrap();
        let result = tx.commit().await;

        assert!(matches!(result, Err(RepositoryError::Transaction(_))));
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let repo = MemorySessionRepository::new();
        let s = session("dup", 1, Duration::days(1));

        let mut tx = repo.begin().await.unwrap();
        tx.insert(&s).await.unwrap();
        assert!(matches!(
            tx.insert(&s).await,
            Err(RepositoryError::DuplicateSession)
        ));
        assert!(matches!(
            tx.find_by_digest(&digest("missing")).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            tx.update_expiry(&digest("missing"), Utc::now()).await,
            Err(RepositoryError::Persistence(_))
        ));
        tx.delete_by_digest(&digest("missing")).await.unwrap();
    }

    #[tokio::test]
    async fn test_bulk_deletes() {
        let repo = MemorySessionRepository::new();
        let now = Utc::now();

        let mut tx = repo.begin().await.unwrap();
        tx.insert(&session("u1-live", 1, Duration::days(3))).await.unwrap();
        tx.insert(&session("u1-dead", 1, Duration::days(-3))).await.unwrap();
        tx.insert(&session("u2-dead", 2, Duration::days(-1))).await.unwrap();
        tx.insert(&session("u3-live", 3, Duration::days(3))).await.unwrap();

        assert_eq!(tx.delete_expired(now).await.unwrap(), 2);
        assert_eq!(tx.delete_by_user(1).await.unwrap(), 1);
        tx.commit().await.unwrap();

        assert_eq!(repo.len().await, 1);
        assert!(repo.get(&digest("u3-live")).await.is_some());
    }

    #[tokio::test]
    async fn test_injected_begin_failure() {
        let repo = MemorySessionRepository::new();
        repo.faults().fail_begin(true);

        assert!(matches!(
            repo.begin().await,
            Err(RepositoryError::Transaction(_))
        ));
    }
}
