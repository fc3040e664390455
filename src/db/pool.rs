//! Database connection pool abstraction
//!
//! Session storage runs on SQLite, MySQL or PostgreSQL. The appropriate pool
//! is created from configuration and handed around as a [`DynDatabasePool`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions},
    postgres::{PgConnectOptions, PgPool, PgPoolOptions},
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DatabaseConfig, DatabaseDriver};

/// How long a SQLite connection waits for another connection's write lock
/// before giving up with `SQLITE_BUSY`.
pub const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a caller waits for a free pooled connection
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Database pool trait that abstracts over different database backends.
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Round-trip a trivial query to prove the store is reachable
    async fn ping(&self) -> Result<()>;

    /// Close every pooled connection
    async fn close(&self);

    fn driver(&self) -> DatabaseDriver;

    fn as_sqlite(&self) -> Option<&SqlitePool>;

    fn as_mysql(&self) -> Option<&MySqlPool>;

    fn as_postgres(&self) -> Option<&PgPool>;
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite session store (a file, or a private in-memory database)
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Open a SQLite session store.
    ///
    /// `url` is either a plain file path, a `sqlite:` URL or `:memory:`.
    /// Missing parent directories and the database file are created.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let options = sqlite_connect_options(url)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite session store: {}", url))?;

        Ok(Self { pool })
    }
}

fn sqlite_connect_options(url: &str) -> Result<SqliteConnectOptions> {
    if url == ":memory:" || url.starts_with("sqlite::memory:") {
        return SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Failed to build in-memory SQLite options");
    }

    let options = match url.strip_prefix("sqlite:") {
        Some(rest) => {
            let path = rest.trim_start_matches("//");
            let path = path.split('?').next().unwrap_or(path);
            create_parent_dir(Path::new(path))?;
            SqliteConnectOptions::from_str(url)
                .with_context(|| format!("Invalid SQLite URL: {}", url))?
        }
        None => {
            create_parent_dir(Path::new(url))?;
            SqliteConnectOptions::new().filename(url)
        }
    };

    Ok(options
        .create_if_missing(true)
        .busy_timeout(SQLITE_BUSY_TIMEOUT))
}

fn create_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory: {:?}", parent)),
        _ => Ok(()),
    }
}

#[async_trait]
impl DatabasePool for SqliteDatabase {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("SQLite session store is unreachable")?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::Sqlite
    }

    fn as_sqlite(&self) -> Option<&SqlitePool> {
        Some(&self.pool)
    }

    fn as_mysql(&self) -> Option<&MySqlPool> {
        None
    }

    fn as_postgres(&self) -> Option<&PgPool> {
        None
    }
}

// ============================================================================
// MySQL
// ============================================================================

/// MySQL session store
pub struct MysqlDatabase {
    pool: MySqlPool,
}

impl MysqlDatabase {
    /// Connect to a MySQL session store. A missing `mysql://` scheme is added.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let url = with_scheme(url, &["mysql://"]);
        let options = MySqlConnectOptions::from_str(&url).context("Invalid MySQL URL")?;

        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .context("Failed to connect to MySQL session store")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl DatabasePool for MysqlDatabase {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("MySQL session store is unreachable")?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::Mysql
    }

    fn as_sqlite(&self) -> Option<&SqlitePool> {
        None
    }

    fn as_mysql(&self) -> Option<&MySqlPool> {
        Some(&self.pool)
    }

    fn as_postgres(&self) -> Option<&PgPool> {
        None
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// PostgreSQL session store
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    /// Connect to a PostgreSQL session store. A missing `postgres://` scheme is added.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let url = with_scheme(url, &["postgres://", "postgresql://"]);
        let options = PgConnectOptions::from_str(&url).context("Invalid PostgreSQL URL")?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .context("Failed to connect to PostgreSQL session store")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl DatabasePool for PostgresDatabase {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("PostgreSQL session store is unreachable")?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::Postgres
    }

    fn as_sqlite(&self) -> Option<&SqlitePool> {
        None
    }

    fn as_mysql(&self) -> Option<&MySqlPool> {
        None
    }

    fn as_postgres(&self) -> Option<&PgPool> {
        Some(&self.pool)
    }
}

/// Prefix `url` with the first of `schemes` unless it already has one of them
fn with_scheme(url: &str, schemes: &[&str]) -> String {
    if schemes.iter().any(|scheme| url.starts_with(scheme)) {
        url.to_string()
    } else {
        format!("{}{}", schemes[0], url)
    }
}

/// Type alias for a shared database pool
pub type DynDatabasePool = Arc<dyn DatabasePool>;

/// Create a database connection pool based on configuration.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
///
/// # Example
///
/// ```ignore
/// use whisper_session::config::DatabaseConfig;
/// use whisper_session::db::create_pool;
///
/// let config = DatabaseConfig::default();
/// let pool = create_pool(&config).await?;
/// pool.ping().await?;
/// ```
pub async fn create_pool(config: &DatabaseConfig) -> Result<DynDatabasePool> {
    match config.driver {
        DatabaseDriver::Sqlite => {
            let db = SqliteDatabase::new(&config.url, config.max_connections).await?;
            Ok(Arc::new(db))
        }
        DatabaseDriver::Mysql => {
            let db = MysqlDatabase::new(&config.url, config.max_connections).await?;
            Ok(Arc::new(db))
        }
        DatabaseDriver::Postgres => {
            let db = PostgresDatabase::new(&config.url, config.max_connections).await?;
            Ok(Arc::new(db))
        }
    }
}

/// Create a SQLite in-memory database pool for testing.
///
/// One connection only: every connection to `:memory:` is its own database.
pub async fn create_test_pool() -> Result<DynDatabasePool> {
    let config = DatabaseConfig {
        driver: DatabaseDriver::Sqlite,
        url: ":memory:".to_string(),
        max_connections: 1,
    };
    create_pool(&config).await
}
