//! Configuration management
//!
//! Configuration is loaded from:
//! - a YAML file (`config.yml` by default)
//! - environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.
//!
//! Session lifetime and renewal threshold are deliberately not part of the
//! file format; see [`crate::services::session::SessionPolicy`].

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Session maintenance configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite, mysql or postgres)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Upper bound on pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_database_url() -> String {
    "data/sessions.db".to_string()
}

fn default_max_connections() -> u32 {
    20
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// MySQL
    Mysql,
    /// PostgreSQL
    Postgres,
}

/// Session maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds between background purges of expired sessions (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    3600
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            }
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - WHISPER_DATABASE_DRIVER
    /// - WHISPER_DATABASE_URL
    /// - WHISPER_DATABASE_MAX_CONNECTIONS
    /// - WHISPER_SESSION_SWEEP_INTERVAL_SECONDS
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Reject values that parse but cannot work
    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database.url cannot be empty".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        if let Ok(driver) = std::env::var("WHISPER_DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "mysql" => self.database.driver = DatabaseDriver::Mysql,
                "postgres" | "postgresql" => self.database.driver = DatabaseDriver::Postgres,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(url) = std::env::var("WHISPER_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(max) = std::env::var("WHISPER_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse::<u32>() {
                if max > 0 {
                    self.database.max_connections = max;
                }
            }
        }

        if let Ok(interval) = std::env::var("WHISPER_SESSION_SWEEP_INTERVAL_SECONDS") {
            if let Ok(interval) = interval.parse::<u64>() {
                self.session.sweep_interval_seconds = interval;
            }
        }
    }
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared by every test module that touches WHISPER_* variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
const ENV_KEYS: &[&str] = &[
    "WHISPER_DATABASE_DRIVER",
    "WHISPER_DATABASE_URL",
    "WHISPER_DATABASE_MAX_CONNECTIONS",
    "WHISPER_SESSION_SWEEP_INTERVAL_SECONDS",
];

#[cfg(test)]
fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        super::CONFIG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let path = std::path::Path::new("nonexistent_session_config.yml");
        let config = Config::load(path).unwrap();

        assert_eq!(config.database.driver, DatabaseDriver::Sqlite);
        assert_eq!(config.database.url, "data/sessions.db");
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.session.sweep_interval_seconds, 3600);
    }

    #[test]
    fn test_load_empty_file_returns_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "   \n").unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.database.driver, DatabaseDriver::Sqlite);
        assert_eq!(config.session.sweep_interval_seconds, 3600);
    }

    #[test]
    fn test_load_partial_config_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "database:\n  driver: postgres\n").unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.database.driver, DatabaseDriver::Postgres);
        assert_eq!(config.database.url, "data/sessions.db");
        assert_eq!(config.session.sweep_interval_seconds, 3600);
    }

    #[test]
    fn test_load_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
database:
  driver: mysql
  url: "mysql://whisper:secret@db/whisper"
  max_connections: 8
session:
  sweep_interval_seconds: 0
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.database.driver, DatabaseDriver::Mysql);
        assert_eq!(config.database.url, "mysql://whisper:secret@db/whisper");
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.session.sweep_interval_seconds, 0);
    }

    #[test]
    fn test_load_invalid_yaml_returns_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "database:\n  driver: [unclosed\n").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Failed to parse config file"), "{}", message);
    }

    #[test]
    fn test_load_unknown_driver_returns_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "database:\n  driver: oracle\n").unwrap();

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_load_zero_max_connections_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "database:\n  max_connections: 0\n").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn test_env_override_database_config() {
        let _guard = lock_env();
        clear_env();

        std::env::set_var("WHISPER_DATABASE_DRIVER", "postgresql");
        std::env::set_var("WHISPER_DATABASE_URL", "postgres://localhost/whisper");
        std::env::set_var("WHISPER_DATABASE_MAX_CONNECTIONS", "5");

        let config =
            Config::load_with_env(std::path::Path::new("nonexistent_session_config.yml")).unwrap();

        assert_eq!(config.database.driver, DatabaseDriver::Postgres);
        assert_eq!(config.database.url, "postgres://localhost/whisper");
        assert_eq!(config.database.max_connections, 5);

        clear_env();
    }

    #[test]
    fn test_env_override_sweep_interval() {
        let _guard = lock_env();
        clear_env();

        std::env::set_var("WHISPER_SESSION_SWEEP_INTERVAL_SECONDS", "60");

        let config =
            Config::load_with_env(std::path::Path::new("nonexistent_session_config.yml")).unwrap();
        assert_eq!(config.session.sweep_interval_seconds, 60);

        clear_env();
    }

    #[test]
    fn test_env_override_invalid_values_ignored() {
        let _guard = lock_env();
        clear_env();

        std::env::set_var("WHISPER_DATABASE_DRIVER", "oracle");
        std::env::set_var("WHISPER_DATABASE_MAX_CONNECTIONS", "0");
        std::env::set_var("WHISPER_SESSION_SWEEP_INTERVAL_SECONDS", "soon");

        let config =
            Config::load_with_env(std::path::Path::new("nonexistent_session_config.yml")).unwrap();

        assert_eq!(config.database.driver, DatabaseDriver::Sqlite);
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.session.sweep_interval_seconds, 3600);

        clear_env();
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_driver_strategy() -> impl Strategy<Value = DatabaseDriver> {
        prop_oneof![
            Just(DatabaseDriver::Sqlite),
            Just(DatabaseDriver::Mysql),
            Just(DatabaseDriver::Postgres),
        ]
    }

    fn valid_url_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z][a-z0-9_/]{0,20}\\.db".prop_map(|s| s),
            Just(":memory:".to_string()),
            Just("mysql://root@127.0.0.1:3306/whisper".to_string()),
            Just("postgres://whisper@localhost/whisper".to_string()),
        ]
    }

    fn valid_config_strategy() -> impl Strategy<Value = Config> {
        (
            valid_driver_strategy(),
            valid_url_strategy(),
            1u32..=200,
            0u64..=86_400,
        )
            .prop_map(|(driver, url, max_connections, sweep)| Config {
                database: DatabaseConfig {
                    driver,
                    url,
                    max_connections,
                },
                session: SessionConfig {
                    sweep_interval_seconds: sweep,
                },
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(20))]

        /// Serializing any valid config to YAML and loading it back yields the same values.
        #[test]
        fn config_yaml_roundtrip(config in valid_config_strategy()) {
            let yaml = serde_yaml::to_string(&config).expect("Failed to serialize config");

            let mut file = NamedTempFile::new().expect("Failed to create temp file");
            write!(file, "{}", yaml).expect("Failed to write config");

            let parsed = Config::load(file.path()).expect("Failed to parse config");

            prop_assert_eq!(config.database.driver, parsed.database.driver);
            prop_assert_eq!(config.database.url, parsed.database.url);
            prop_assert_eq!(config.database.max_connections, parsed.database.max_connections);
            prop_assert_eq!(
                config.session.sweep_interval_seconds,
                parsed.session.sweep_interval_seconds
            );
        }
    }
}
