//! Connection and transaction scopes.
//!
//! A [`ConnectionScope`] owns one pooled connection for a bounded extent and
//! returns it to the pool exactly once, when the scope is released or
//! dropped. Handlers work through cloneable [`DbConnection`] handles; once the
//! owning scope is gone every handle fails with `DbError::ScopeClosed`.
//!
//! A [`TransactionScope`] is opened from a live connection and ends in
//! exactly one commit or rollback. Dropping it undecided rolls back, which
//! covers early returns, unwinding, and cancelled futures. Nested scopes map
//! to SQLite savepoints.

use rusqlite::Connection;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::pool::PooledConnection;
use crate::registry::Model;
use crate::schema;
use crate::stats::Counters;
use crate::DbError;

struct ConnState {
    conn: Option<PooledConnection>,
    /// Number of open transaction levels on `conn`.
    tx_depth: u32,
}

impl ConnState {
    fn conn(&self) -> Result<&Connection, DbError> {
        self.conn.as_deref().ok_or(DbError::ScopeClosed)
    }
}

struct Shared {
    state: Mutex<ConnState>,
    counters: Arc<Counters>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // A statement panicked mid-flight. The connection itself is
                // still usable; the open transaction is rolled back on release.
                tracing::error!("connection scope lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        let Some(conn) = state.conn.take() else {
            return;
        };

        if state.tx_depth > 0 {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "rollback on connection release failed");
            }
            state.tx_depth = 0;
            self.counters.rolled_back();
        }

        drop(conn);
        self.counters.released();
        tracing::trace!("connection returned to pool");
    }
}

/// A cloneable handle to the connection held by a [`ConnectionScope`].
#[derive(Clone)]
pub struct DbConnection {
    shared: Arc<Shared>,
}

impl DbConnection {
    /// Runs `f` against the connection on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ScopeClosed` if the scope has been released, or
    /// whatever `f` returns.
    pub async fn run<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || {
            let state = shared.lock();
            f(state.conn()?)
        })
        .await?
    }

    /// Whether the owning scope still holds the connection.
    pub fn is_open(&self) -> bool {
        self.shared.lock().conn.is_some()
    }

    /// Whether a transaction is open on this connection.
    pub fn in_transaction(&self) -> bool {
        self.shared.lock().tx_depth > 0
    }

    /// Opens a transaction scope, or a savepoint if one is already open.
    pub async fn transaction(&self) -> Result<TransactionScope, DbError> {
        TransactionScope::begin(self.clone(), false).await
    }

    /// Opens a transaction scope that always rolls back, even on `commit`.
    pub async fn test_transaction(&self) -> Result<TransactionScope, DbError> {
        TransactionScope::begin(self.clone(), true).await
    }

    /// Creates the tables of `models` if they do not exist.
    pub async fn create_tables(&self, models: &[Model]) -> Result<(), DbError> {
        let defs: Vec<_> = models.iter().map(|m| m.def().clone()).collect();
        self.run(move |conn| Ok(schema::create_tables(conn, &defs)?))
            .await
    }

    /// Drops the tables of `models` if they exist, in reverse order.
    pub async fn drop_tables(&self, models: &[Model]) -> Result<(), DbError> {
        let defs: Vec<_> = models.iter().map(|m| m.def().clone()).collect();
        self.run(move |conn| Ok(schema::drop_tables(conn, &defs)?))
            .await
    }
}

impl fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("DbConnection")
            .field("open", &state.conn.is_some())
            .field("tx_depth", &state.tx_depth)
            .finish()
    }
}

/// Owns one pooled connection until released or dropped.
pub struct ConnectionScope {
    handle: DbConnection,
}

impl ConnectionScope {
    pub(crate) fn new(conn: PooledConnection, counters: Arc<Counters>) -> Self {
        Self {
            handle: DbConnection {
                shared: Arc::new(Shared {
                    state: Mutex::new(ConnState {
                        conn: Some(conn),
                        tx_depth: 0,
                    }),
                    counters,
                }),
            },
        }
    }

    /// Returns a handle that can be passed to handlers.
    pub fn handle(&self) -> DbConnection {
        self.handle.clone()
    }

    /// Returns the connection to the pool. Equivalent to dropping the scope.
    pub fn release(self) {}
}

impl Deref for ConnectionScope {
    type Target = DbConnection;

    fn deref(&self) -> &DbConnection {
        &self.handle
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        self.handle.shared.release();
    }
}

impl fmt::Debug for ConnectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionScope").field(&self.handle).finish()
    }
}

fn savepoint(depth: u32) -> String {
    format!("keel_sp_{depth}")
}

fn finish_blocking(shared: &Shared, depth: u32, commit: bool) -> Result<(), DbError> {
    let mut state = shared.lock();
    let conn = state.conn()?;

    if state.tx_depth <= depth {
        tracing::debug!(depth, "transaction already ended by an enclosing scope");
        return Ok(());
    }

    let sql = match (depth, commit) {
        (0, true) => "COMMIT".to_string(),
        (0, false) => "ROLLBACK".to_string(),
        (_, true) => format!("RELEASE SAVEPOINT {}", savepoint(depth)),
        (_, false) => format!(
            "ROLLBACK TO SAVEPOINT {sp}; RELEASE SAVEPOINT {sp}",
            sp = savepoint(depth)
        ),
    };

    match conn.execute_batch(&sql) {
        Ok(()) => {
            state.tx_depth = depth;
            if commit {
                shared.counters.committed();
            } else {
                shared.counters.rolled_back();
            }
            Ok(())
        }
        Err(e) => {
            if commit && !conn.is_autocommit() {
                let undo = if depth == 0 {
                    "ROLLBACK".to_string()
                } else {
                    format!(
                        "ROLLBACK TO SAVEPOINT {sp}; RELEASE SAVEPOINT {sp}",
                        sp = savepoint(depth)
                    )
                };
                if let Err(undo_err) = conn.execute_batch(&undo) {
                    tracing::warn!(error = %undo_err, "rollback after failed commit also failed");
                }
            }
            state.tx_depth = depth;
            shared.counters.rolled_back();
            Err(e.into())
        }
    }
}

/// One unit of work on a [`DbConnection`].
///
/// Derefs to the connection so statements can run through the scope.
pub struct TransactionScope {
    conn: DbConnection,
    depth: u32,
    finished: bool,
    rollback_only: bool,
}

impl TransactionScope {
    async fn begin(conn: DbConnection, rollback_only: bool) -> Result<Self, DbError> {
        let shared = Arc::clone(&conn.shared);
        let depth = tokio::task::spawn_blocking(move || {
            let mut state = shared.lock();
            let depth = state.tx_depth;
            let sql = if depth == 0 {
                "BEGIN".to_string()
            } else {
                format!("SAVEPOINT {}", savepoint(depth))
            };
            state.conn()?.execute_batch(&sql)?;
            state.tx_depth = depth + 1;
            Ok::<_, DbError>(depth)
        })
        .await??;

        tracing::trace!(depth, rollback_only, "transaction started");

        Ok(Self {
            conn,
            depth,
            finished: false,
            rollback_only,
        })
    }

    /// Commits the transaction. Test scopes roll back instead.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the commit fails; the transaction is
    /// rolled back in that case.
    pub async fn commit(mut self) -> Result<(), DbError> {
        let commit = !self.rollback_only;
        self.finish(commit).await
    }

    /// Rolls the transaction back.
    pub async fn rollback(mut self) -> Result<(), DbError> {
        self.finish(false).await
    }

    /// Nesting level: `0` for a real transaction, `n` for the n-th savepoint.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    async fn finish(&mut self, commit: bool) -> Result<(), DbError> {
        // Marked first: the blocking task completes even if this future is
        // dropped, so Drop must not try a second time.
        self.finished = true;
        let shared = Arc::clone(&self.conn.shared);
        let depth = self.depth;
        tokio::task::spawn_blocking(move || finish_blocking(&shared, depth, commit)).await?
    }
}

impl Deref for TransactionScope {
    type Target = DbConnection;

    fn deref(&self) -> &DbConnection {
        &self.conn
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Blocks until any in-flight statement on this connection completes.
        match finish_blocking(&self.conn.shared, self.depth, false) {
            Ok(()) => tracing::debug!(depth = self.depth, "transaction rolled back on drop"),
            Err(DbError::ScopeClosed) => {}
            Err(e) => tracing::warn!(error = %e, "rollback on drop failed"),
        }
    }
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("depth", &self.depth)
            .field("finished", &self.finished)
            .field("rollback_only", &self.rollback_only)
            .finish()
    }
}
