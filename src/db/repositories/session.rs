//! Session repository
//!
//! Transaction-scoped storage for session records keyed by token digest.
//!
//! This module provides:
//! - `SessionRepository` / `SessionTransaction` traits defining the storage contract
//! - `SqlxSessionRepository` implementing them for SQLite, MySQL and PostgreSQL
//!
//! Every operation runs inside a transaction obtained from
//! [`SessionRepository::begin`]. A transaction that is dropped without
//! [`SessionTransaction::commit`] is rolled back, so no exit path can leave a
//! half-applied change behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    mysql::MySqlRow, postgres::PgRow, sqlite::SqliteRow, MySql, MySqlConnection, PgConnection,
    Postgres, Row, Sqlite, SqliteConnection, Transaction,
};
use std::sync::Arc;

use crate::config::DatabaseDriver;
use crate::db::DynDatabasePool;
use crate::models::Session;
use crate::services::token::SessionDigest;

/// Errors raised by session storage
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// No session row for the digest
    #[error("Session not found")]
    NotFound,

    /// A row with the same digest already exists
    #[error("Duplicate session digest")]
    DuplicateSession,

    /// Any other storage failure inside an open transaction
    #[error("Persistence failure: {0:#}")]
    Persistence(#[source] anyhow::Error),

    /// Beginning, committing or rolling back the transaction failed
    #[error("Transaction failure: {0:#}")]
    Transaction(#[source] anyhow::Error),
}

impl RepositoryError {
    fn persistence(err: sqlx::Error, what: &'static str) -> Self {
        Self::Persistence(anyhow::Error::new(err).context(what))
    }

    fn transaction(err: sqlx::Error, what: &'static str) -> Self {
        Self::Transaction(anyhow::Error::new(err).context(what))
    }

    fn from_insert(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::DuplicateSession;
            }
        }
        Self::persistence(err, "Failed to create session")
    }
}

/// Session storage that hands out transactions
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Open a new transaction
    async fn begin(&self) -> Result<Box<dyn SessionTransaction>, RepositoryError>;
}

/// Operations available inside one storage transaction
#[async_trait]
pub trait SessionTransaction: Send {
    /// Insert a new session; `DuplicateSession` if the digest exists
    async fn insert(&mut self, session: &Session) -> Result<(), RepositoryError>;

    /// Get a session by digest; `NotFound` if absent
    async fn find_by_digest(&mut self, id: &SessionDigest) -> Result<Session, RepositoryError>;

    /// Move a session's expiry. The row must exist.
    async fn update_expiry(
        &mut self,
        id: &SessionDigest,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Delete a session; deleting an absent digest is not an error
    async fn delete_by_digest(&mut self, id: &SessionDigest) -> Result<(), RepositoryError>;

    /// Delete all sessions of a user, returning how many went away
    async fn delete_by_user(&mut self, user_id: i64) -> Result<u64, RepositoryError>;

    /// Delete every session that expired strictly before `now`
    async fn delete_expired(&mut self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;

    /// Make all changes durable
    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;

    /// Discard all changes. Dropping the transaction has the same effect.
    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// SQLx-based session repository implementation
///
/// Supports SQLite, MySQL and PostgreSQL databases.
pub struct SqlxSessionRepository {
    pool: DynDatabasePool,
}

impl SqlxSessionRepository {
    /// Create a new SQLx session repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn SessionRepository> {
        Arc::new(Self::new(pool))
    }
}

fn missing_pool(driver: DatabaseDriver) -> RepositoryError {
    RepositoryError::Transaction(anyhow::anyhow!(
        "Database pool reports {:?} driver but exposes no matching pool",
        driver
    ))
}

#[async_trait]
impl SessionRepository for SqlxSessionRepository {
    async fn begin(&self) -> Result<Box<dyn SessionTransaction>, RepositoryError> {
        const BEGIN_FAILED: &str = "Failed to begin session transaction";

        let driver = self.pool.driver();
        let tx = match driver {
            DatabaseDriver::Sqlite => {
                let pool = self.pool.as_sqlite().ok_or_else(|| missing_pool(driver))?;
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| RepositoryError::transaction(e, BEGIN_FAILED))?;
                take_write_lock_sqlite(&mut tx).await?;
                SqlxSessionTransaction::Sqlite(tx)
            }
            DatabaseDriver::Mysql => {
                let pool = self.pool.as_mysql().ok_or_else(|| missing_pool(driver))?;
                SqlxSessionTransaction::Mysql(
                    pool.begin()
                        .await
                        .map_err(|e| RepositoryError::transaction(e, BEGIN_FAILED))?,
                )
            }
            DatabaseDriver::Postgres => {
                let pool = self.pool.as_postgres().ok_or_else(|| missing_pool(driver))?;
                SqlxSessionTransaction::Postgres(
                    pool.begin()
                        .await
                        .map_err(|e| RepositoryError::transaction(e, BEGIN_FAILED))?,
                )
            }
        };

        Ok(Box::new(tx))
    }
}

/// An open SQLx transaction on one of the supported backends
pub enum SqlxSessionTransaction {
    Sqlite(Transaction<'static, Sqlite>),
    Mysql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
}

#[async_trait]
impl SessionTransaction for SqlxSessionTransaction {
    async fn insert(&mut self, session: &Session) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(tx) => insert_session_sqlite(tx, session).await,
            Self::Mysql(tx) => insert_session_mysql(tx, session).await,
            Self::Postgres(tx) => insert_session_postgres(tx, session).await,
        }
    }

    async fn find_by_digest(&mut self, id: &SessionDigest) -> Result<Session, RepositoryError> {
        let found = match self {
            Self::Sqlite(tx) => find_session_sqlite(tx, id).await?,
            Self::Mysql(tx) => find_session_mysql(tx, id).await?,
            Self::Postgres(tx) => find_session_postgres(tx, id).await?,
        };
        found.ok_or(RepositoryError::NotFound)
    }

    async fn update_expiry(
        &mut self,
        id: &SessionDigest,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let affected = match self {
            Self::Sqlite(tx) => update_expiry_sqlite(tx, id, expires_at).await?,
            Self::Mysql(tx) => update_expiry_mysql(tx, id, expires_at).await?,
            Self::Postgres(tx) => update_expiry_postgres(tx, id, expires_at).await?,
        };

        if affected > 0 {
            return Ok(());
        }

        // Some drivers count changed rows rather than matched rows, so an
        // unchanged expiry also reports zero.
        match self.find_by_digest(id).await {
            Ok(_) => Ok(()),
            Err(RepositoryError::NotFound) => Err(RepositoryError::Persistence(anyhow::anyhow!(
                "No session row {} to update",
                id.short()
            ))),
            Err(e) => Err(e),
        }
    }

    async fn delete_by_digest(&mut self, id: &SessionDigest) -> Result<(), RepositoryError> {
        match self {
            Self::Sqlite(tx) => delete_session_sqlite(tx, id).await,
            Self::Mysql(tx) => delete_session_mysql(tx, id).await,
            Self::Postgres(tx) => delete_session_postgres(tx, id).await,
        }
    }

    async fn delete_by_user(&mut self, user_id: i64) -> Result<u64, RepositoryError> {
        match self {
            Self::Sqlite(tx) => delete_sessions_by_user_sqlite(tx, user_id).await,
            Self::Mysql(tx) => delete_sessions_by_user_mysql(tx, user_id).await,
            Self::Postgres(tx) => delete_sessions_by_user_postgres(tx, user_id).await,
        }
    }

    async fn delete_expired(&mut self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        match self {
            Self::Sqlite(tx) => delete_expired_sessions_sqlite(tx, now).await,
            Self::Mysql(tx) => delete_expired_sessions_mysql(tx, now).await,
            Self::Postgres(tx) => delete_expired_sessions_postgres(tx, now).await,
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        const COMMIT_FAILED: &str = "Failed to commit session transaction";

        let result = match *self {
            Self::Sqlite(tx) => tx.commit().await,
            Self::Mysql(tx) => tx.commit().await,
            Self::Postgres(tx) => tx.commit().await,
        };
        result.map_err(|e| RepositoryError::transaction(e, COMMIT_FAILED))
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        const ROLLBACK_FAILED: &str = "Failed to roll back session transaction";

        let result = match *self {
            Self::Sqlite(tx) => tx.rollback().await,
            Self::Mysql(tx) => tx.rollback().await,
            Self::Postgres(tx) => tx.rollback().await,
        };
        result.map_err(|e| RepositoryError::transaction(e, ROLLBACK_FAILED))
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

/// A deferred SQLite transaction that reads before it writes cannot wait for
/// the write lock later; it fails with `SQLITE_BUSY` instead. Writing first
/// (zero rows) takes the lock up front, honouring the busy timeout, so
/// concurrent transactions queue instead of failing.
async fn take_write_lock_sqlite(conn: &mut SqliteConnection) -> Result<(), RepositoryError> {
    sqlx::query("UPDATE sessions SET expires_at = expires_at WHERE 0")
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::transaction(e, "Failed to lock session store"))?;

    Ok(())
}

async fn insert_session_sqlite(
    conn: &mut SqliteConnection,
    session: &Session,
) -> Result<(), RepositoryError> {
    sqlx::query("INSERT INTO sessions (id, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(session.id.as_str())
        .bind(session.user_id)
        .bind(session.expires_at)
        .execute(conn)
        .await
        .map_err(RepositoryError::from_insert)?;

    Ok(())
}

async fn find_session_sqlite(
    conn: &mut SqliteConnection,
    id: &SessionDigest,
) -> Result<Option<Session>, RepositoryError> {
    let row = sqlx::query("SELECT id, user_id, expires_at FROM sessions WHERE id = ?")
        .bind(id.as_str())
        .fetch_optional(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to get session by digest"))?;

    row.as_ref().map(row_to_session_sqlite).transpose()
}

async fn update_expiry_sqlite(
    conn: &mut SqliteConnection,
    id: &SessionDigest,
    expires_at: DateTime<Utc>,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query("UPDATE sessions SET expires_at = ? WHERE id = ?")
        .bind(expires_at)
        .bind(id.as_str())
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to update session expiry"))?;

    Ok(result.rows_affected())
}

async fn delete_session_sqlite(
    conn: &mut SqliteConnection,
    id: &SessionDigest,
) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id.as_str())
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to delete session"))?;

    Ok(())
}

async fn delete_sessions_by_user_sqlite(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(user_id)
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to delete sessions by user"))?;

    Ok(result.rows_affected())
}

async fn delete_expired_sessions_sqlite(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
        .bind(now)
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to delete expired sessions"))?;

    Ok(result.rows_affected())
}

fn row_to_session_sqlite(row: &SqliteRow) -> Result<Session, RepositoryError> {
    const DECODE_FAILED: &str = "Failed to decode session row";

    let id: String = row
        .try_get("id")
        .map_err(|e| RepositoryError::persistence(e, DECODE_FAILED))?;

    Ok(Session {
        id: decode_digest(id)?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| RepositoryError::persistence(e, DECODE_FAILED))?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|e| RepositoryError::persistence(e, DECODE_FAILED))?,
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn insert_session_mysql(
    conn: &mut MySqlConnection,
    session: &Session,
) -> Result<(), RepositoryError> {
    sqlx::query("INSERT INTO sessions (id, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(session.id.as_str())
        .bind(session.user_id)
        .bind(session.expires_at)
        .execute(conn)
        .await
        .map_err(RepositoryError::from_insert)?;

    Ok(())
}

async fn find_session_mysql(
    conn: &mut MySqlConnection,
    id: &SessionDigest,
) -> Result<Option<Session>, RepositoryError> {
    let row = sqlx::query("SELECT id, user_id, expires_at FROM sessions WHERE id = ?")
        .bind(id.as_str())
        .fetch_optional(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to get session by digest"))?;

    row.as_ref().map(row_to_session_mysql).transpose()
}

async fn update_expiry_mysql(
    conn: &mut MySqlConnection,
    id: &SessionDigest,
    expires_at: DateTime<Utc>,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query("UPDATE sessions SET expires_at = ? WHERE id = ?")
        .bind(expires_at)
        .bind(id.as_str())
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to update session expiry"))?;

    Ok(result.rows_affected())
}

async fn delete_session_mysql(
    conn: &mut MySqlConnection,
    id: &SessionDigest,
) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id.as_str())
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to delete session"))?;

    Ok(())
}

async fn delete_sessions_by_user_mysql(
    conn: &mut MySqlConnection,
    user_id: i64,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(user_id)
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to delete sessions by user"))?;

    Ok(result.rows_affected())
}

async fn delete_expired_sessions_mysql(
    conn: &mut MySqlConnection,
    now: DateTime<Utc>,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
        .bind(now)
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to delete expired sessions"))?;

    Ok(result.rows_affected())
}

fn row_to_session_mysql(row: &MySqlRow) -> Result<Session, RepositoryError> {
    const DECODE_FAILED: &str = "Failed to decode session row";

    let id: String = row
        .try_get("id")
        .map_err(|e| RepositoryError::persistence(e, DECODE_FAILED))?;

    Ok(Session {
        id: decode_digest(id)?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| RepositoryError::persistence(e, DECODE_FAILED))?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|e| RepositoryError::persistence(e, DECODE_FAILED))?,
    })
}

// ============================================================================
// PostgreSQL implementations
// ============================================================================

async fn insert_session_postgres(
    conn: &mut PgConnection,
    session: &Session,
) -> Result<(), RepositoryError> {
    sqlx::query("INSERT INTO sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
        .bind(session.id.as_str())
        .bind(session.user_id)
        .bind(session.expires_at)
        .execute(conn)
        .await
        .map_err(RepositoryError::from_insert)?;

    Ok(())
}

async fn find_session_postgres(
    conn: &mut PgConnection,
    id: &SessionDigest,
) -> Result<Option<Session>, RepositoryError> {
    let row = sqlx::query("SELECT id, user_id, expires_at FROM sessions WHERE id = $1")
        .bind(id.as_str())
        .fetch_optional(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to get session by digest"))?;

    row.as_ref().map(row_to_session_postgres).transpose()
}

async fn update_expiry_postgres(
    conn: &mut PgConnection,
    id: &SessionDigest,
    expires_at: DateTime<Utc>,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query("UPDATE sessions SET expires_at = $1 WHERE id = $2")
        .bind(expires_at)
        .bind(id.as_str())
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to update session expiry"))?;

    Ok(result.rows_affected())
}

async fn delete_session_postgres(
    conn: &mut PgConnection,
    id: &SessionDigest,
) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(id.as_str())
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to delete session"))?;

    Ok(())
}

async fn delete_sessions_by_user_postgres(
    conn: &mut PgConnection,
    user_id: i64,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
        .bind(user_id)
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to delete sessions by user"))?;

    Ok(result.rows_affected())
}

async fn delete_expired_sessions_postgres(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
        .bind(now)
        .execute(conn)
        .await
        .map_err(|e| RepositoryError::persistence(e, "Failed to delete expired sessions"))?;

    Ok(result.rows_affected())
}

fn row_to_session_postgres(row: &PgRow) -> Result<Session, RepositoryError> {
    const DECODE_FAILED: &str = "Failed to decode session row";

    let id: String = row
        .try_get("id")
        .map_err(|e| RepositoryError::persistence(e, DECODE_FAILED))?;

    Ok(Session {
        id: decode_digest(id)?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| RepositoryError::persistence(e, DECODE_FAILED))?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|e| RepositoryError::persistence(e, DECODE_FAILED))?,
    })
}

fn decode_digest(id: String) -> Result<SessionDigest, RepositoryError> {
    SessionDigest::from_hex(id).map_err(|e| RepositoryError::Persistence(e.into()))
}
