//! Services layer - Session lifecycle logic
//!
//! This module contains the business rules of the session subsystem:
//! - Generating bearer tokens and their storage digests
//! - Creating, validating, renewing and revoking sessions
//! - Periodically purging expired sessions

pub mod clock;
pub mod session;
pub mod sweeper;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use session::{
    IssuedSession, SessionPolicy, SessionService, SessionServiceError, SESSION_LIFETIME_DAYS,
    SESSION_RENEWAL_THRESHOLD_DAYS,
};
pub use sweeper::spawn_expired_session_sweeper;
pub use token::{
    digest, generate_session_token, generate_session_token_with, EntropyError, EntropySource,
    OsEntropy, SessionDigest, SessionToken,
};
