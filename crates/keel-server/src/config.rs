//! Configuration loading from file and environment variables.

use keel_db::ConnectionParams;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database and plugin settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL: `sqlite:///<path>` or `sqlite:///:memory:`.
    #[serde(default = "default_connection")]
    pub connection: String,

    /// Pool and per-connection settings.
    #[serde(default)]
    pub connection_params: ConnectionParams,

    /// Wrap every request in a connection scope.
    #[serde(default = "default_true")]
    pub auto_connection: bool,

    /// Also wrap every request in a transaction.
    #[serde(default = "default_true")]
    pub auto_transaction: bool,

    /// Expose the migration commands.
    #[serde(default = "default_true")]
    pub migrations_enabled: bool,

    /// Directory holding migration files.
    #[serde(default = "default_migrations_path")]
    pub migrations_path: String,

    /// Create and drop tables around test scopes.
    #[serde(default = "default_true")]
    pub test_setup_db: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "keel_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_connection() -> String {
    "sqlite:///db.sqlite".to_string()
}

fn default_migrations_path() -> String {
    "migrations".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection: default_connection(),
            connection_params: ConnectionParams::default(),
            auto_connection: true,
            auto_transaction: true,
            migrations_enabled: true,
            migrations_path: default_migrations_path(),
            test_setup_db: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

fn env_flag(value: &str) -> bool {
    value == "true" || value == "1"
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `KEEL_HOST` overrides `server.host`
/// - `KEEL_PORT` overrides `server.port`
/// - `KEEL_DB_CONNECTION` overrides `database.connection`
/// - `KEEL_DB_AUTO_CONNECTION` overrides `database.auto_connection`
/// - `KEEL_DB_AUTO_TRANSACTION` overrides `database.auto_transaction`
/// - `KEEL_DB_MIGRATIONS_ENABLED` overrides `database.migrations_enabled`
/// - `KEEL_DB_MIGRATIONS_PATH` overrides `database.migrations_path`
/// - `KEEL_LOG_LEVEL` overrides `logging.level`
/// - `KEEL_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `KEEL_*` overrides read through `lookup`.
fn apply_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("KEEL_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("KEEL_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(connection) = lookup("KEEL_DB_CONNECTION") {
        config.database.connection = connection;
    }
    if let Some(flag) = lookup("KEEL_DB_AUTO_CONNECTION") {
        config.database.auto_connection = env_flag(&flag);
    }
    if let Some(flag) = lookup("KEEL_DB_AUTO_TRANSACTION") {
        config.database.auto_transaction = env_flag(&flag);
    }
    if let Some(flag) = lookup("KEEL_DB_MIGRATIONS_ENABLED") {
        config.database.migrations_enabled = env_flag(&flag);
    }
    if let Some(path) = lookup("KEEL_DB_MIGRATIONS_PATH") {
        config.database.migrations_path = path;
    }
    if let Some(level) = lookup("KEEL_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("KEEL_LOG_JSON") {
        config.logging.json = env_flag(&json);
    }
}
