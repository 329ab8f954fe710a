//! keel server library logic.
//!
//! Wires the database layer into axum: the [`Plugin`] owns the model
//! registry and the live manager, [`middleware`] scopes each request to a
//! pooled connection and transaction, and [`cli`] exposes the migration
//! commands.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod middleware;
pub mod plugin;

use std::net::SocketAddr;

use tokio::net::TcpListener;

pub use error::{ApiError, CommandError, PluginError};
pub use middleware::{db_scope_middleware, DbScope, ScopePolicy};
pub use plugin::{Plugin, PluginGuard};

/// Serves `router` on `addr` between the plugin's startup and shutdown hooks.
///
/// Shutdown runs even when startup or serving fails.
///
/// # Errors
///
/// Returns the first failure among startup, binding, serving, and shutdown.
pub async fn serve(
    plugin: &Plugin,
    router: axum::Router,
    addr: SocketAddr,
) -> Result<(), CommandError> {
    let served = run_server(plugin, router, addr).await;
    let closed = plugin.shutdown().await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "server stopped with an error");
    }
    served?;
    closed?;
    tracing::info!("keel server shut down");
    Ok(())
}

async fn run_server(
    plugin: &Plugin,
    router: axum::Router,
    addr: SocketAddr,
) -> Result<(), CommandError> {
    plugin.startup().await?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "starting keel server");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
