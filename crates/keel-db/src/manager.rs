//! The manager: owner of the connection pool.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::pool::{create_pool, Backend, ConnectionParams, DbPool, PooledConnection};
use crate::registry::Model;
use crate::scope::ConnectionScope;
use crate::stats::{Counters, ManagerStats};
use crate::DbError;
use keel_types::PLACEHOLDER_URL;

/// Owns zero or one live connection pool for a single backend.
///
/// A manager is shared as `Arc<Manager>`. The pool is opened by
/// [`Manager::connect`] and closed by [`Manager::disconnect`]; both are
/// expected exactly once per application lifetime.
pub struct Manager {
    url: String,
    backend: Backend,
    params: ConnectionParams,
    /// Name of the shared-cache database for in-memory backends.
    shared_name: String,
    pool: RwLock<Option<DbPool>>,
    counters: Arc<Counters>,
}

impl Manager {
    /// Creates a manager for `url` without opening any connection.
    ///
    /// # Errors
    ///
    /// Returns `DbError::UnsupportedBackend` if `url` cannot be parsed.
    pub fn new(url: &str, params: ConnectionParams) -> Result<Arc<Self>, DbError> {
        let backend = Backend::parse(url)?;
        Ok(Arc::new(Self {
            url: url.to_string(),
            backend,
            params,
            shared_name: format!("keel-{}", uuid::Uuid::new_v4().simple()),
            pool: RwLock::new(None),
            counters: Arc::new(Counters::default()),
        }))
    }

    /// Creates the placeholder manager that accepts model registrations
    /// before the application is configured.
    pub fn placeholder() -> Arc<Self> {
        Arc::new(Self {
            url: PLACEHOLDER_URL.to_string(),
            backend: Backend::Placeholder,
            params: ConnectionParams::default(),
            shared_name: String::new(),
            pool: RwLock::new(None),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// The database name, `None` for the placeholder.
    pub fn database(&self) -> Option<String> {
        self.backend.database()
    }

    pub fn is_placeholder(&self) -> bool {
        self.backend == Backend::Placeholder
    }

    /// Whether a pool is currently open.
    pub fn is_connected(&self) -> bool {
        self.read_pool().is_some()
    }

    /// Returns a snapshot of the lifecycle counters.
    pub fn stats(&self) -> ManagerStats {
        self.counters.snapshot()
    }

    fn read_pool(&self) -> Option<DbPool> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write_pool(&self) -> std::sync::RwLockWriteGuard<'_, Option<DbPool>> {
        match self.pool.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("manager pool lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Opens the connection pool.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Placeholder` for the placeholder manager,
    /// `DbError::AlreadyConnected` if a pool is already open, and
    /// `DbError::Pool` if the pool cannot be built.
    pub async fn connect(&self) -> Result<(), DbError> {
        if self.is_placeholder() {
            return Err(DbError::Placeholder);
        }
        if self.is_connected() {
            return Err(DbError::AlreadyConnected);
        }

        let backend = self.backend.clone();
        let shared_name = self.shared_name.clone();
        let params = self.params.clone();
        // Building the pool opens its initial connections.
        let pool =
            tokio::task::spawn_blocking(move || create_pool(&backend, &shared_name, &params))
                .await??;

        let mut slot = self.write_pool();
        if slot.is_some() {
            return Err(DbError::AlreadyConnected);
        }
        *slot = Some(pool);
        self.counters.connected();

        tracing::info!(url = %self.url, "database connected");
        Ok(())
    }

    /// Closes the connection pool.
    ///
    /// Connections still checked out close when their scopes end.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotConnected` if no pool is open.
    pub async fn disconnect(&self) -> Result<(), DbError> {
        self.close()
    }

    /// Synchronous form of [`Manager::disconnect`], for drop guards.
    pub fn close(&self) -> Result<(), DbError> {
        let pool = self.write_pool().take().ok_or(DbError::NotConnected)?;
        drop(pool);
        self.counters.disconnected();

        let stats = self.stats();
        tracing::info!(
            url = %self.url,
            acquired = stats.acquired,
            released = stats.released,
            "database disconnected"
        );
        Ok(())
    }

    fn pool(&self) -> Result<DbPool, DbError> {
        if self.is_placeholder() {
            return Err(DbError::Placeholder);
        }
        self.read_pool().ok_or(DbError::NotConnected)
    }

    /// Acquires a connection scope, waiting for a free pool slot if needed.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotConnected` before `connect`, or `DbError::Pool`
    /// if no slot frees up within the connection timeout.
    pub async fn connection(&self) -> Result<ConnectionScope, DbError> {
        let pool = self.pool()?;
        let conn = tokio::task::spawn_blocking(move || pool.get()).await??;
        self.counters.acquired();
        Ok(ConnectionScope::new(conn, Arc::clone(&self.counters)))
    }

    /// Checks out a connection synchronously.
    ///
    /// For code running off the async runtime, such as the migration router.
    /// Must not be called from an async context.
    pub fn blocking_connection(&self) -> Result<PooledConnection, DbError> {
        Ok(self.pool()?.get()?)
    }

    /// Creates the tables of `models` on a fresh connection.
    pub async fn create_tables(&self, models: &[Model]) -> Result<(), DbError> {
        let scope = self.connection().await?;
        scope.create_tables(models).await
    }

    /// Drops the tables of `models` on a fresh connection.
    pub async fn drop_tables(&self, models: &[Model]) -> Result<(), DbError> {
        let scope = self.connection().await?;
        scope.drop_tables(models).await
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_manager() -> Arc<Manager> {
        Manager::new("sqlite:///:memory:", ConnectionParams::default())
            .expect("memory url should parse")
    }

    #[tokio::test]
    async fn connect_then_disconnect_counts_once() {
        let manager = memory_manager();
        assert!(!manager.is_connected());

        manager.connect().await.expect("connect");
        assert!(manager.is_connected());
        manager.disconnect().await.expect("disconnect");
        assert!(!manager.is_connected());

        let stats = manager.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.disconnects, 1);
    }

    #[tokio::test]
    async fn double_connect_is_rejected() {
        let manager = memory_manager();
        manager.connect().await.expect("connect");

        let err = manager.connect().await.expect_err("second connect must fail");
        assert!(matches!(err, DbError::AlreadyConnected));
        assert_eq!(manager.stats().connects, 1);
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_rejected() {
        let manager = memory_manager();
        let err = manager
            .disconnect()
            .await
            .expect_err("disconnect before connect must fail");
        assert!(matches!(err, DbError::NotConnected));
        assert_eq!(manager.stats().disconnects, 0);
    }

    #[tokio::test]
    async fn placeholder_never_connects() {
        let manager = Manager::placeholder();
        assert!(manager.is_placeholder());
        assert_eq!(manager.database(), None);

        let err = manager.connect().await.expect_err("placeholder connect");
        assert!(matches!(err, DbError::Placeholder));
        let err = manager.connection().await.expect_err("placeholder checkout");
        assert!(matches!(err, DbError::Placeholder));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn connection_requires_connect() {
        let manager = memory_manager();
        let err = manager.connection().await.expect_err("not connected");
        assert!(matches!(err, DbError::NotConnected));
    }

    #[tokio::test]
    async fn scopes_are_released_once() {
        let manager = memory_manager();
        manager.connect().await.expect("connect");

        let scope = manager.connection().await.expect("scope");
        let handle = scope.handle();
        assert_eq!(manager.stats().in_use(), 1);

        scope.release();
        assert!(!handle.is_open());
        let stats = manager.stats();
        assert_eq!((stats.acquired, stats.released), (1, 1));

        let err = handle
            .run(|conn| Ok(conn.execute_batch("SELECT 1")?))
            .await
            .expect_err("handle must not outlive its scope");
        assert!(matches!(err, DbError::ScopeClosed));
        assert_eq!(manager.stats().released, 1);
    }

    #[tokio::test]
    async fn pool_timeout_surfaces_as_pool_error() {
        let params = ConnectionParams {
            pool_max_size: 1,
            connection_timeout_ms: 250,
            ..ConnectionParams::default()
        };
        let manager = Manager::new("sqlite:///:memory:", params).expect("manager");
        manager.connect().await.expect("connect");

        let _held = manager.connection().await.expect("first scope");
        let err = manager
            .connection()
            .await
            .expect_err("pool is exhausted");
        assert!(matches!(err, DbError::Pool(_)));
    }
}
