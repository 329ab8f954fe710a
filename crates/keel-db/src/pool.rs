//! Connection URL parsing and pool construction.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::DbError;
use keel_types::PLACEHOLDER_URL;

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// A connection checked out of [`DbPool`].
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Backend-specific connection options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionParams {
    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// How long a checkout may wait for a free slot, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Extra `PRAGMA key = value` statements run on every new connection.
    #[serde(default)]
    pub pragmas: BTreeMap<String, String>,
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            pool_max_size: default_pool_max_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            pragmas: BTreeMap::new(),
        }
    }
}

/// The store a connection URL points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// `dummy://localhost`: accepts registrations, never connects.
    Placeholder,
    /// `sqlite:///:memory:`.
    SqliteMemory,
    /// `sqlite:///<path>`.
    SqliteFile(PathBuf),
}

impl Backend {
    /// Parses a connection URL.
    ///
    /// # Errors
    ///
    /// Returns `DbError::UnsupportedBackend` for any scheme other than
    /// `sqlite:///` and the placeholder URL.
    pub fn parse(url: &str) -> Result<Self, DbError> {
        if url == PLACEHOLDER_URL || url.starts_with("dummy://") {
            return Ok(Self::Placeholder);
        }

        match url.strip_prefix("sqlite:///") {
            Some(":memory:") => Ok(Self::SqliteMemory),
            Some(path) if !path.is_empty() => Ok(Self::SqliteFile(PathBuf::from(path))),
            _ => Err(DbError::UnsupportedBackend(url.to_string())),
        }
    }

    /// The database name as SQLite sees it, `None` for the placeholder.
    pub fn database(&self) -> Option<String> {
        match self {
            Self::Placeholder => None,
            Self::SqliteMemory => Some(":memory:".to_string()),
            Self::SqliteFile(path) => Some(path.display().to_string()),
        }
    }
}

/// Creates a SQLite pool with WAL mode and foreign keys enabled.
///
/// In-memory backends need a `shared_name`: the pooled connection opens a
/// shared-cache database that lives as long as the pool does. Shared-cache
/// table locks fail with `SQLITE_LOCKED` instead of honouring the busy
/// timeout, so an in-memory pool holds a single connection and concurrent
/// checkouts queue on the pool.
///
/// # Errors
///
/// Returns `DbError::Placeholder` for the placeholder backend and
/// `DbError::Pool` if the pool cannot be built.
pub fn create_pool(
    backend: &Backend,
    shared_name: &str,
    params: &ConnectionParams,
) -> Result<DbPool, DbError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = match backend {
        Backend::Placeholder => return Err(DbError::Placeholder),
        Backend::SqliteFile(path) => SqliteConnectionManager::file(path).with_flags(flags),
        Backend::SqliteMemory => {
            SqliteConnectionManager::file(format!("file:{shared_name}?mode=memory&cache=shared"))
                .with_flags(flags | OpenFlags::SQLITE_OPEN_URI)
        }
    };

    let busy_timeout_ms = params.busy_timeout_ms;
    let pragmas = params.pragmas.clone();
    let manager = manager.with_init(move |conn| {
        // In-memory databases report "memory" which is expected and acceptable.
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        if journal_mode != "wal" && journal_mode != "memory" {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!(
                    "failed to set WAL journal mode, got: {}",
                    journal_mode
                )),
            ));
        }
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            busy_timeout_ms
        ))?;
        for (key, value) in &pragmas {
            conn.execute_batch(&format!("PRAGMA {key} = {value};"))?;
        }
        Ok(())
    });

    let max_size = match backend {
        Backend::SqliteMemory => 1,
        _ => params.pool_max_size,
    };
    if max_size != params.pool_max_size {
        tracing::debug!(
            requested = params.pool_max_size,
            "in-memory database uses a single pooled connection"
        );
    }

    let mut builder = Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_millis(params.connection_timeout_ms));

    // The shared in-memory database disappears with its last connection.
    if *backend == Backend::SqliteMemory {
        builder = builder.max_lifetime(None).idle_timeout(None);
    }

    Ok(builder.build(manager)?)
}
