//! Session service
//!
//! Owns the session lifecycle:
//! - issuing a bearer token and persisting its digest
//! - validating a presented token, with sliding renewal
//! - invalidating one session, all sessions of a user, or every expired session
//!
//! A session moves through `absent -> active -> (renewed -> active) ->
//! expired/invalidated -> absent`. Every multi-step sequence runs inside one
//! storage transaction; correctness under concurrency comes from the store's
//! isolation, not from in-process locking. Two concurrent renewals of the same
//! session both move `expires_at` forward, and the last write wins.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::db::repositories::{RepositoryError, SessionRepository, SessionTransaction};
use crate::models::Session;
use crate::services::clock::{Clock, SystemClock};
use crate::services::token::{
    generate_session_token_with, EntropyError, EntropySource, OsEntropy, SessionDigest,
    SessionToken,
};

/// Lifetime of a fresh or renewed session, in days
pub const SESSION_LIFETIME_DAYS: i64 = 30;

/// A session is renewed once fewer than this many days remain
pub const SESSION_RENEWAL_THRESHOLD_DAYS: i64 = 15;

/// Expiry and renewal policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// How long a session lives after creation or renewal
    pub lifetime: Duration,
    /// Remaining lifetime below which validation renews the session
    pub renewal_threshold: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            lifetime: Duration::days(SESSION_LIFETIME_DAYS),
            renewal_threshold: Duration::days(SESSION_RENEWAL_THRESHOLD_DAYS),
        }
    }
}

impl SessionPolicy {
    /// Whether a live session should be pushed forward at `now`
    pub fn needs_renewal(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now > session.expires_at - self.renewal_threshold
    }
}

/// Error types for session service operations
#[derive(Debug, thiserror::Error)]
pub enum SessionServiceError {
    /// The entropy source failed; the request cannot get a token
    #[error("Random source unavailable: {0}")]
    RandomSourceUnavailable(#[from] EntropyError),

    /// No session for the presented token
    #[error("Session not found")]
    SessionNotFound,

    /// The session existed but its expiry has passed
    #[error("Session expired")]
    SessionExpired,

    /// The store refused the new session (duplicate digest or storage error)
    #[error("Failed to create session: {0}")]
    SessionCreationFailed(#[source] RepositoryError),

    /// The store failed while reading or renewing a session
    #[error("Failed to look up session: {0}")]
    SessionLookupFailed(#[source] RepositoryError),

    /// Beginning or committing the transaction failed; nothing was applied
    #[error("Session transaction failed: {0}")]
    TransactionFailure(#[source] RepositoryError),
}

impl SessionServiceError {
    /// True for outcomes that mean "log in again" rather than a server fault
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::SessionNotFound | Self::SessionExpired)
    }
}

/// A freshly created session together with the only copy of its token
#[derive(Debug, Clone)]
pub struct IssuedSession {
    /// Bearer token for the client; the server keeps no copy
    pub token: SessionToken,
    /// The persisted record
    pub session: Session,
}

/// Session service for issuing, validating and revoking sessions
pub struct SessionService {
    repo: Arc<dyn SessionRepository>,
    policy: SessionPolicy,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn EntropySource>,
}

impl SessionService {
    /// Create a session service with the default policy, wall clock and OS entropy
    pub fn new(repo: Arc<dyn SessionRepository>) -> Self {
        Self {
            repo,
            policy: SessionPolicy::default(),
            clock: Arc::new(SystemClock),
            entropy: Arc::new(OsEntropy),
        }
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Generate a token without creating a session for it
    pub fn generate_session_token(&self) -> Result<SessionToken, SessionServiceError> {
        generate_session_token_with(self.entropy.as_ref()).map_err(|e| {
            tracing::error!(error = %e, "Failed to generate session token");
            SessionServiceError::RandomSourceUnavailable(e)
        })
    }

    /// Create a session for an already authenticated user
    ///
    /// # Errors
    ///
    /// - `RandomSourceUnavailable` if no token could be generated
    /// - `SessionCreationFailed` if the store rejected the record
    /// - `TransactionFailure` if the transaction could not begin or commit
    pub async fn create_session(&self, user_id: i64) -> Result<IssuedSession, SessionServiceError> {
        let token = self.generate_session_token()?;
        let session = Session {
            id: token.digest(),
            user_id,
            expires_at: self.clock.now() + self.policy.lifetime,
        };

        let mut tx = self.begin().await?;

        if let Err(e) = tx.insert(&session).await {
            match &e {
                RepositoryError::DuplicateSession => tracing::warn!(
                    user_id,
                    digest = session.id.short(),
                    "Session digest collision; token generator may be faulty"
                ),
                _ => tracing::error!(user_id, error = %e, "Failed to insert session"),
            }
            return Err(SessionServiceError::SessionCreationFailed(e));
        }

        self.commit(tx).await?;

        tracing::info!(
            user_id,
            digest = session.id.short(),
            expires_at = %session.expires_at,
            "Session created"
        );

        Ok(IssuedSession { token, session })
    }

    /// Validate a presented token and return its (possibly renewed) session
    ///
    /// An expired session is deleted on the way out; if that cleanup fails the
    /// outcome is still `SessionExpired`.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` if no session matches the token
    /// - `SessionExpired` if the session's expiry has passed
    /// - `SessionLookupFailed` for storage errors while reading or renewing
    /// - `TransactionFailure` if the transaction could not begin or commit
    pub async fn validate_session_token(&self, token: &str) -> Result<Session, SessionServiceError> {
        let id = SessionDigest::from_token_str(token);

        let mut tx = self.begin().await?;

        let mut session = match tx.find_by_digest(&id).await {
            Ok(session) => session,
            Err(RepositoryError::NotFound) => {
                tracing::debug!(digest = id.short(), "Session not found");
                return Err(SessionServiceError::SessionNotFound);
            }
            Err(e) => {
                tracing::error!(digest = id.short(), error = %e, "Failed to look up session");
                return Err(SessionServiceError::SessionLookupFailed(e));
            }
        };

        let now = self.clock.now();

        if session.is_expired_at(now) {
            tracing::debug!(
                digest = id.short(),
                user_id = session.user_id,
                "Session expired"
            );
            self.discard_expired(tx, &id).await;
            return Err(SessionServiceError::SessionExpired);
        }

        if self.policy.needs_renewal(&session, now) {
            let renewed_until = now + self.policy.lifetime;
            if let Err(e) = tx.update_expiry(&id, renewed_until).await {
                tracing::error!(digest = id.short(), error = %e, "Failed to renew session");
                return Err(SessionServiceError::SessionLookupFailed(e));
            }
            tracing::debug!(
                digest = id.short(),
                from = %session.expires_at,
                to = %renewed_until,
                "Session renewed"
            );
            session.expires_at = renewed_until;
        }

        self.commit(tx).await?;

        Ok(session)
    }

    /// Delete the session with the given digest. Absent sessions are fine.
    ///
    /// # Errors
    ///
    /// - `TransactionFailure` if the delete could not be applied
    pub async fn invalidate_session(&self, id: &SessionDigest) -> Result<(), SessionServiceError> {
        let mut tx = self.begin().await?;

        if let Err(e) = tx.delete_by_digest(id).await {
            tracing::error!(digest = id.short(), error = %e, "Failed to delete session");
            return Err(SessionServiceError::TransactionFailure(e));
        }

        self.commit(tx).await?;

        tracing::debug!(digest = id.short(), "Session invalidated");
        Ok(())
    }

    /// Delete the session a presented token refers to
    pub async fn invalidate_token(&self, token: &str) -> Result<(), SessionServiceError> {
        self.invalidate_session(&SessionDigest::from_token_str(token))
            .await
    }

    /// Delete every session of a user ("log out everywhere")
    ///
    /// Returns the number of sessions removed.
    pub async fn invalidate_user_sessions(&self, user_id: i64) -> Result<u64, SessionServiceError> {
        let mut tx = self.begin().await?;

        let removed = match tx.delete_by_user(user_id).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!(user_id, error = %e, "Failed to delete user sessions");
                return Err(SessionServiceError::TransactionFailure(e));
            }
        };

        self.commit(tx).await?;

        tracing::info!(user_id, removed, "User sessions invalidated");
        Ok(removed)
    }

    /// Delete every session that has already expired
    ///
    /// Returns the number of sessions removed.
    pub async fn purge_expired(&self) -> Result<u64, SessionServiceError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let removed = match tx.delete_expired(now).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!(error = %e, "Failed to purge expired sessions");
                return Err(SessionServiceError::TransactionFailure(e));
            }
        };

        self.commit(tx).await?;

        Ok(removed)
    }

    // ========================================================================
    // Private helper methods
    // ========================================================================

    async fn begin(&self) -> Result<Box<dyn SessionTransaction>, SessionServiceError> {
        self.repo.begin().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to begin session transaction");
            SessionServiceError::TransactionFailure(e)
        })
    }

    async fn commit(&self, tx: Box<dyn SessionTransaction>) -> Result<(), SessionServiceError> {
        tx.commit().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to commit session transaction");
            SessionServiceError::TransactionFailure(e)
        })
    }

    /// Best-effort removal of an expired row inside the lookup transaction
    async fn discard_expired(&self, mut tx: Box<dyn SessionTransaction>, id: &SessionDigest) {
        if let Err(e) = tx.delete_by_digest(id).await {
            tracing::warn!(digest = id.short(), error = %e, "Failed to delete expired session");
            return;
        }
        if let Err(e) = tx.commit().await {
            tracing::warn!(digest = id.short(), error = %e, "Failed to commit expired session cleanup");
        }
    }
}
