//! Database configuration.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::error::{LedgerError, Result};

/// Connection pool and PostgreSQL connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Full connection string. Overrides the individual fields when set.
    pub dsn: Option<String>,
    /// Database user.
    pub user: String,
    /// Database password.
    pub password: String,
    /// Database host.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// libpq `sslmode` value.
    pub ssl_mode: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long `begin` waits for a pooled connection before failing.
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            user: "postgres".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 5432,
            database: "simple-bank".to_string(),
            ssl_mode: "disable".to_string(),
            max_connections: 20,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DatabaseConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from a variable lookup, falling back to defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dsn) = var("DB_DSN").filter(|dsn| !dsn.is_empty()) {
            config.dsn = Some(dsn);
        }

        if let Some(user) = var("POSTGRES_USER") {
            config.user = user;
        }

        if let Some(password) = var("POSTGRES_PASSWORD") {
            config.password = password;
        }

        if let Some(host) = var("POSTGRES_HOST") {
            config.host = host;
        }

        if let Some(port) = var("POSTGRES_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }

        if let Some(database) = var("POSTGRES_DB") {
            config.database = database;
        }

        if let Some(ssl_mode) = var("POSTGRES_SSLMODE") {
            config.ssl_mode = ssl_mode;
        }

        if let Some(max) = var("DB_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                config.max_connections = max;
            }
        }

        if let Some(secs) = var("DB_ACQUIRE_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                config.acquire_timeout = Duration::from_secs(secs);
            }
        }

        config
    }

    /// Build a config around a connection string.
    pub fn with_dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(LedgerError::Configuration(
                "max_connections cannot be 0".to_string(),
            ));
        }

        if self.dsn.is_some() {
            return Ok(());
        }

        if self.host.is_empty() {
            return Err(LedgerError::Configuration(
                "Database host cannot be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(LedgerError::Configuration(
                "Database port cannot be 0".to_string(),
            ));
        }

        if self.database.is_empty() {
            return Err(LedgerError::Configuration(
                "Database name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Build sqlx connect options.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(dsn) = &self.dsn {
            return dsn
                .parse::<PgConnectOptions>()
                .map_err(|e| LedgerError::Configuration(format!("Invalid DB_DSN: {e}")));
        }

        let ssl_mode = self
            .ssl_mode
            .parse::<PgSslMode>()
            .map_err(|e| LedgerError::Configuration(format!("Invalid sslmode: {e}")))?;

        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(ssl_mode))
    }
}
