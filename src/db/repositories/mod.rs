//! Database repositories
//!
//! Session storage behind a transaction-scoped trait, with a SQL-backed
//! implementation and an in-memory one.

pub mod memory;
pub mod session;

pub use memory::{FaultPlan, MemorySessionRepository, MemorySessionTransaction};
pub use session::{
    RepositoryError, SessionRepository, SessionTransaction, SqlxSessionRepository,
    SqlxSessionTransaction,
};
