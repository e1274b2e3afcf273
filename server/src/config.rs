//! Configuration management for the server.

use std::env;

/// Default number of records returned by one sync page.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// How far a sync page's `startedAt` trails the clock.
pub const DEFAULT_CHECKPOINT_LAG_MS: u64 = 5_000;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Upper bound on pooled database connections
    pub db_max_connections: u32,
    /// Shared bearer token. Requests are unauthenticated when unset.
    pub auth_secret: Option<String>,
    /// Page size used when a sync request carries no limit
    pub sync_page_limit: usize,
    /// Margin subtracted from `startedAt`. Must exceed the longest time
    /// between stamping a mutation and committing it.
    pub sync_checkpoint_lag_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let db_max_connections = match env::var("DB_MAX_CONNECTIONS") {
            Ok(raw) => match raw.parse::<u32>() {
                Ok(max) if max > 0 => max,
                _ => return Err(ConfigError::InvalidMaxConnections(raw)),
            },
            Err(_) => DEFAULT_MAX_CONNECTIONS,
        };

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());

        let sync_page_limit = match env::var("SYNC_PAGE_LIMIT") {
            Ok(raw) => match raw.parse::<usize>() {
                Ok(limit) if limit > 0 => limit,
                _ => return Err(ConfigError::InvalidPageLimit(raw)),
            },
            Err(_) => DEFAULT_PAGE_LIMIT,
        };

        let sync_checkpoint_lag_ms = match env::var("SYNC_CHECKPOINT_LAG_MS") {
            Ok(raw) => raw
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidCheckpointLag(raw))?,
            Err(_) => DEFAULT_CHECKPOINT_LAG_MS,
        };

        Ok(Self {
            host,
            port,
            database_url,
            db_max_connections,
            auth_secret,
            sync_page_limit,
            sync_checkpoint_lag_ms,
        })
    }

    /// Configuration for an in-process server with no database URL.
    pub fn local() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: String::new(),
            db_max_connections: DEFAULT_MAX_CONNECTIONS,
            auth_secret: None,
            sync_page_limit: DEFAULT_PAGE_LIMIT,
            sync_checkpoint_lag_ms: DEFAULT_CHECKPOINT_LAG_MS,
        }
    }

    pub fn with_auth_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth_secret = Some(secret.into());
        self
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid SYNC_PAGE_LIMIT value: {0}")]
    InvalidPageLimit(String),

    #[error("Invalid DB_MAX_CONNECTIONS value: {0}")]
    InvalidMaxConnections(String),

    #[error("Invalid SYNC_CHECKPOINT_LAG_MS value: {0}")]
    InvalidCheckpointLag(String),
}
