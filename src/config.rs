//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Event store database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Message log database URL (defaults to the event store database)
    pub message_log_url: String,

    /// Database URL the rebuilder writes the fresh audit log to
    /// (defaults to the event store database)
    pub rebuild_audit_url: String,

    /// Snapshot freshness window in milliseconds
    pub snapshot_freshness_ms: u64,

    /// Environment (development, production)
    pub environment: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DATABASE_MAX_CONNECTIONS"))?;

        let message_log_url =
            env::var("MESSAGE_LOG_URL").unwrap_or_else(|_| database_url.clone());

        let rebuild_audit_url =
            env::var("REBUILD_AUDIT_URL").unwrap_or_else(|_| database_url.clone());

        let snapshot_freshness_ms = env::var("SNAPSHOT_FRESHNESS_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("SNAPSHOT_FRESHNESS_MS"))?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        Ok(Self {
            database_url,
            database_max_connections,
            message_log_url,
            rebuild_audit_url,
            snapshot_freshness_ms,
            environment,
        })
    }

    pub fn snapshot_freshness(&self) -> Duration {
        Duration::from_millis(self.snapshot_freshness_ms)
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
