//! Database layer
//!
//! Session storage supports:
//! - SQLite (default, for single-binary deployment)
//! - MySQL
//! - PostgreSQL
//!
//! The database driver is selected based on configuration.
//!
//! # Usage
//!
//! ```ignore
//! use whisper_session::config::DatabaseConfig;
//! use whisper_session::db::{create_pool, migrations};
//! use whisper_session::db::repositories::SqlxSessionRepository;
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//! let sessions = SqlxSessionRepository::boxed(pool.clone());
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{
    create_pool, create_test_pool, DatabasePool, DynDatabasePool, MysqlDatabase,
    PostgresDatabase, SqliteDatabase,
};
