//! Error types for the plugin, the HTTP surface, and the command line.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use keel_db::{DbError, MigrationError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by [`crate::Plugin`].
#[derive(Debug, Error)]
pub enum PluginError {
    /// An operation needed the live manager before `setup` ran.
    #[error("plugin is not installed; call setup first")]
    NotInstalled,

    /// `setup` was called twice.
    #[error("plugin is already installed")]
    AlreadyInstalled,

    /// A migration command ran with `migrations_enabled = false`.
    #[error("migrations are disabled by configuration")]
    MigrationsDisabled,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl From<tokio::task::JoinError> for PluginError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Db(DbError::TaskJoin(e))
    }
}

/// Errors surfaced to HTTP clients as JSON bodies.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::InvalidValue { .. }
            | DbError::InvalidChoice { .. }
            | DbError::UnknownField { .. } => Self::BadRequest(e.to_string()),
            DbError::NotFound { .. } => Self::NotFound(e.to_string()),
            other => Self::InternalServerError(other.to_string()),
        }
    }
}

impl From<PluginError> for ApiError {
    fn from(e: PluginError) -> Self {
        match e {
            PluginError::Db(db) => db.into(),
            other => Self::InternalServerError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Errors from running a command-line subcommand.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Binding or serving the listener failed.
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}
