//! Session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::token::SessionDigest;

/// Persisted session record.
///
/// `id` is the digest of the bearer token, never the token itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session ID (digest of the bearer token)
    pub id: SessionDigest,
    /// Owning user ID
    pub user_id: i64,
    /// Expiration timestamp
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// True once `now` is strictly past `expires_at`.
    ///
    /// A session expiring exactly at `now` is still valid for that instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session_expiring_at(expires_at: DateTime<Utc>) -> Session {
        Session {
            id: SessionDigest::from_token_str("token"),
            user_id: 1,
            expires_at,
        }
    }

    #[test]
    fn test_session_expiration_check() {
        let now = Utc::now();

        assert!(session_expiring_at(now - Duration::hours(1)).is_expired_at(now));
        assert!(!session_expiring_at(now + Duration::hours(1)).is_expired_at(now));
    }

    #[test]
    fn test_expiry_boundary_is_strict() {
        let now = Utc::now();
        let session = session_expiring_at(now);

        assert!(!session.is_expired_at(now));
        assert!(session.is_expired_at(now + Duration::nanoseconds(1)));
    }
}
