//! Database layer for keel.
//!
//! Provides the [`Manager`] that owns an `r2d2` pool of SQLite connections,
//! RAII connection and transaction scopes, the two-phase model registry,
//! per-field value conversion, and a file-based migration router.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: every pooled connection runs in WAL mode with
//!   foreign keys on. Readers do not block the single writer.
//! - **Blocking work off the runtime**: `rusqlite` is synchronous, so every
//!   statement issued from async code runs on `spawn_blocking`.
//! - **Scopes as guards**: releasing a connection and rolling back an
//!   undecided transaction happen in `Drop`, so they also run when a request
//!   future is cancelled or a handler panics.
//! - **Placeholder manager**: models register before configuration against a
//!   manager that can never connect, then move to the live one at setup.

pub mod codec;
mod error;
mod manager;
pub mod migrations;
mod pool;
mod registry;
mod rows;
pub mod schema;
mod scope;
mod stats;

pub use error::DbError;
pub use manager::Manager;
pub use migrations::{MigrationError, MigrationScript, MigrationStatus, Router};
pub use pool::{create_pool, Backend, ConnectionParams, DbPool, PooledConnection};
pub use registry::{Model, ModelRegistry, RegisteredModel};
pub use rows::RowData;
pub use scope::{ConnectionScope, DbConnection, TransactionScope};
pub use stats::ManagerStats;
