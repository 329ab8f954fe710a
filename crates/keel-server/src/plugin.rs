//! The plugin: registry, live manager, lifecycle hooks, and migration commands.
//!
//! A [`Plugin`] is created before the application is configured so models
//! can register early. [`Plugin::setup`] builds the live [`Manager`] from the
//! database configuration and rebinds every registered model to it.
//! [`Plugin::install`] adds the per-request scope layer to a router.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;
use keel_db::{
    DbConnection, DbError, Manager, MigrationError, MigrationStatus, Model, ModelRegistry,
    Router as MigrationRouter, TransactionScope,
};
use keel_types::ModelDef;

use crate::config::DatabaseConfig;
use crate::error::PluginError;
use crate::middleware::{db_scope_middleware, DbScope, ScopePolicy};

struct Installed {
    config: DatabaseConfig,
    manager: Arc<Manager>,
    migrations: MigrationRouter,
}

struct Inner {
    registry: ModelRegistry,
    installed: RwLock<Option<Arc<Installed>>>,
}

/// Database plugin handle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Plugin {
    inner: Arc<Inner>,
}

impl Plugin {
    /// Creates an uninstalled plugin whose models bind to the placeholder.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: ModelRegistry::new(),
                installed: RwLock::new(None),
            }),
        }
    }

    /// Creates a plugin and installs it with `config`.
    pub fn with_config(config: DatabaseConfig) -> Result<Self, PluginError> {
        let plugin = Self::new();
        plugin.setup(config)?;
        Ok(plugin)
    }

    /// Builds the live manager and rebinds every registered model to it.
    ///
    /// No connection is opened here; that happens in [`Plugin::startup`].
    ///
    /// # Errors
    ///
    /// Returns `PluginError::AlreadyInstalled` on a second call and
    /// `PluginError::Db` if the connection URL is not supported.
    pub fn setup(&self, config: DatabaseConfig) -> Result<(), PluginError> {
        let mut slot = self.inner.installed.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(PluginError::AlreadyInstalled);
        }

        let manager = Manager::new(&config.connection, config.connection_params.clone())?;
        let migrations = MigrationRouter::new(&config.migrations_path);
        self.inner.registry.rebind_all(Arc::clone(&manager));

        tracing::info!(
            connection = %config.connection,
            auto_connection = config.auto_connection,
            auto_transaction = config.auto_transaction,
            migrations = config.migrations_enabled,
            "database plugin installed"
        );
        *slot = Some(Arc::new(Installed {
            config,
            manager,
            migrations,
        }));
        Ok(())
    }

    fn installed(&self) -> Result<Arc<Installed>, PluginError> {
        let slot = self.inner.installed.read().unwrap_or_else(|e| e.into_inner());
        slot.clone().ok_or(PluginError::NotInstalled)
    }

    pub fn is_installed(&self) -> bool {
        self.installed().is_ok()
    }

    /// The live manager.
    pub fn manager(&self) -> Result<Arc<Manager>, PluginError> {
        Ok(Arc::clone(&self.installed()?.manager))
    }

    /// The configuration the plugin was installed with.
    pub fn config(&self) -> Result<DatabaseConfig, PluginError> {
        Ok(self.installed()?.config.clone())
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// Registers a model. Before setup it binds to the placeholder manager.
    pub fn register(&self, def: ModelDef) -> Model {
        self.inner.registry.register(def)
    }

    /// Registered models in registration order.
    pub fn models(&self) -> Vec<Model> {
        self.inner.registry.models()
    }

    /// Opens the pool. Run once when the application starts serving.
    pub async fn startup(&self) -> Result<(), PluginError> {
        let manager = self.manager()?;
        manager.connect().await?;
        Ok(())
    }

    /// Closes the pool. Run once when serving stops.
    ///
    /// A pool that was never opened, because startup failed or never ran,
    /// is logged and otherwise ignored.
    pub async fn shutdown(&self) -> Result<(), PluginError> {
        let manager = self.manager()?;
        match manager.disconnect().await {
            Ok(()) => Ok(()),
            Err(DbError::NotConnected) => {
                tracing::warn!("shutdown without an open pool, nothing to close");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Connects and returns a guard that disconnects when dropped.
    pub async fn enter(&self) -> Result<PluginGuard, PluginError> {
        self.startup().await?;
        Ok(PluginGuard {
            manager: self.manager()?,
        })
    }

    /// Acquires a connection scope from the live manager.
    pub async fn connection(&self) -> Result<keel_db::ConnectionScope, PluginError> {
        Ok(self.manager()?.connection().await?)
    }

    /// Opens a transaction on `conn` that rolls back even when committed.
    pub async fn test_transaction(
        &self,
        conn: &DbConnection,
    ) -> Result<TransactionScope, PluginError> {
        Ok(conn.test_transaction().await?)
    }

    fn or_all(&self, models: &[Model]) -> Vec<Model> {
        if models.is_empty() {
            self.models()
        } else {
            models.to_vec()
        }
    }

    /// Creates the tables of `models`, or of every registered model when
    /// `models` is empty.
    pub async fn create_tables(&self, models: &[Model]) -> Result<(), PluginError> {
        let models = self.or_all(models);
        self.manager()?.create_tables(&models).await?;
        Ok(())
    }

    /// Drops the tables of `models`, or of every registered model when
    /// `models` is empty, in reverse order.
    pub async fn drop_tables(&self, models: &[Model]) -> Result<(), PluginError> {
        let models = self.or_all(models);
        self.manager()?.drop_tables(&models).await?;
        Ok(())
    }

    /// Adds the per-request scope layer to `router` according to the
    /// `auto_connection` and `auto_transaction` flags.
    ///
    /// Call this after every other layer so the scope is outermost.
    pub fn install(&self, router: axum::Router) -> Result<axum::Router, PluginError> {
        let installed = self.installed()?;
        let config = &installed.config;
        let Some(policy) = ScopePolicy::from_flags(config.auto_connection, config.auto_transaction)
        else {
            tracing::info!("auto_connection disabled, request scope layer not installed");
            return Ok(router);
        };

        tracing::debug!(?policy, "installing request scope layer");
        let scope = DbScope::new(Arc::clone(&installed.manager), policy);
        Ok(router.layer(axum::middleware::from_fn_with_state(
            scope,
            db_scope_middleware,
        )))
    }

    /// Runs `f` inside a connected plugin with a fresh connection.
    ///
    /// With `test_setup_db` every registered table is created before `f` and
    /// dropped after it. The pool is closed afterwards whatever `f` does,
    /// including panicking.
    pub async fn test_scope<F, Fut, T>(&self, f: F) -> Result<T, PluginError>
    where
        F: FnOnce(DbConnection) -> Fut,
        Fut: Future<Output = T>,
    {
        let setup_db = self.installed()?.config.test_setup_db;
        let guard = self.enter().await?;
        let conn = self.connection().await?;
        let models = self.models();

        if setup_db {
            conn.create_tables(&models).await?;
        }

        let outcome = AssertUnwindSafe(f(conn.handle())).catch_unwind().await;

        let teardown = if setup_db {
            conn.drop_tables(&models).await
        } else {
            Ok(())
        };
        conn.release();
        drop(guard);

        match outcome {
            Ok(value) => teardown.map(|()| value).map_err(PluginError::from),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    fn migration_target(&self) -> Result<(Arc<Manager>, MigrationRouter), PluginError> {
        let installed = self.installed()?;
        if !installed.config.migrations_enabled {
            return Err(PluginError::MigrationsDisabled);
        }
        Ok((Arc::clone(&installed.manager), installed.migrations.clone()))
    }

    /// Runs a migration router operation on the blocking thread pool.
    async fn with_router<F, T>(&self, op: F) -> Result<T, PluginError>
    where
        F: FnOnce(&MigrationRouter, &rusqlite::Connection) -> Result<T, MigrationError>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let (manager, router) = self.migration_target()?;
        let result = tokio::task::spawn_blocking(move || {
            let conn = manager.blocking_connection()?;
            op(&router, &conn)
        })
        .await??;
        Ok(result)
    }

    /// Applies pending migrations up to `name`, or all of them.
    pub async fn migrate(&self, name: Option<String>, fake: bool) -> Result<Vec<String>, PluginError> {
        self.with_router(move |router, conn| router.run(conn, name.as_deref(), fake))
            .await
    }

    /// Writes a new migration. With `auto` it is generated from the
    /// registered models and `None` means the schema already matches.
    pub async fn create_migration(
        &self,
        name: &str,
        auto: bool,
    ) -> Result<Option<String>, PluginError> {
        let name = name.to_string();
        let defs: Option<Vec<ModelDef>> =
            auto.then(|| self.models().iter().map(|m| m.def().clone()).collect());
        self.with_router(move |router, conn| router.create(conn, &name, defs.as_deref()))
            .await
    }

    /// Reverts the latest applied migration.
    pub async fn rollback_migration(&self) -> Result<String, PluginError> {
        self.with_router(|router, conn| router.rollback(conn)).await
    }

    pub async fn list_migrations(&self) -> Result<MigrationStatus, PluginError> {
        self.with_router(|router, conn| router.status(conn)).await
    }

    /// Deletes all migration history.
    pub async fn clear_migrations(&self) -> Result<usize, PluginError> {
        self.with_router(|router, conn| router.clear(conn)).await
    }

    /// Collapses every migration into `001_<name>`.
    pub async fn merge_migrations(&self, name: &str) -> Result<String, PluginError> {
        let name = name.to_string();
        self.with_router(move |router, conn| router.merge(conn, &name))
            .await
    }
}

impl Default for Plugin {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("registry", &self.inner.registry)
            .field("installed", &self.is_installed())
            .finish()
    }
}

/// Keeps the pool open; disconnects when dropped.
#[derive(Debug)]
pub struct PluginGuard {
    manager: Arc<Manager>,
}

impl PluginGuard {
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }
}

impl Drop for PluginGuard {
    fn drop(&mut self) {
        match self.manager.close() {
            Ok(()) | Err(DbError::NotConnected) => {}
            Err(e) => tracing::warn!(error = %e, "disconnect on guard drop failed"),
        }
    }
}
