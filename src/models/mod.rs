//! Data models
//!
//! Persisted entities of the session subsystem.

mod session;

pub use session::Session;
