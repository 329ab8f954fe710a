//! Error type shared by the manager, scopes, and row operations.

use thiserror::Error;

/// Errors raised by the database layer.
///
/// Driver and pool errors are carried unchanged so callers see the original
/// detail.
#[derive(Debug, Error)]
pub enum DbError {
    /// A statement failed inside SQLite.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The pool could not be built or could not hand out a connection in time.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// `connect` was called on a manager that already owns a pool.
    #[error("database is already connected")]
    AlreadyConnected,

    /// A pool operation was attempted before `connect` or after `disconnect`.
    #[error("database is not connected")]
    NotConnected,

    /// The placeholder manager was asked to open a connection.
    #[error("the placeholder manager cannot open connections; run setup first")]
    Placeholder,

    /// The connection URL names a backend this crate does not support.
    #[error("unsupported connection url: {0}")]
    UnsupportedBackend(String),

    /// A connection handle was used after its scope released the connection.
    #[error("connection scope has already been released")]
    ScopeClosed,

    /// A blocking database task panicked or was cancelled.
    #[error("blocking database task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// A value could not be converted for its field.
    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue {
        /// The field being written or read.
        field: String,
        /// What was wrong with the value.
        reason: String,
    },

    /// A value is not one of the field's choices.
    #[error("{value} is not a valid choice for '{field}' (choices: {choices})")]
    InvalidChoice {
        /// The enum field.
        field: String,
        /// The rejected value, rendered as JSON.
        value: String,
        /// Accepted choice names.
        choices: String,
    },

    /// A row referenced a column the model does not define.
    #[error("unknown field '{field}' on '{table}'")]
    UnknownField {
        /// The model's table.
        table: String,
        /// The offending key.
        field: String,
    },

    /// No row exists with the requested primary key.
    #[error("no row with id {id} in '{table}'")]
    NotFound {
        /// The model's table.
        table: String,
        /// The requested primary key.
        id: i64,
    },
}

impl DbError {
    /// Returns `true` when SQLite reported a missing table.
    pub fn is_undefined_table(&self) -> bool {
        match self {
            Self::Sqlite(e) => e.to_string().contains("no such table"),
            _ => false,
        }
    }
}
