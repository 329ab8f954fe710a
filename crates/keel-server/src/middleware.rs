//! Per-request connection and transaction scopes.
//!
//! The layer acquires a pooled connection before the rest of the stack runs
//! and puts a [`DbConnection`] handle into the request extensions. With
//! [`ScopePolicy::ConnectionAndTransaction`] it also opens a transaction that
//! commits when the response status is below 400 and rolls back otherwise.
//!
//! Both scopes are drop guards: if the request future is cancelled or the
//! handler panics, the transaction rolls back and the connection goes back to
//! the pool.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use keel_db::{DbConnection, Manager};

use crate::error::ApiError;

/// What the request layer wraps each request in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePolicy {
    /// A pooled connection only.
    Connection,
    /// A pooled connection and a transaction on it.
    ConnectionAndTransaction,
}

impl ScopePolicy {
    /// Resolves the policy from the configuration flags. `None` means the
    /// layer is not installed at all.
    pub fn from_flags(auto_connection: bool, auto_transaction: bool) -> Option<Self> {
        match (auto_connection, auto_transaction) {
            (false, _) => None,
            (true, false) => Some(Self::Connection),
            (true, true) => Some(Self::ConnectionAndTransaction),
        }
    }
}

/// State for [`db_scope_middleware`], resolved once when the layer is built.
#[derive(Clone, Debug)]
pub struct DbScope {
    manager: Arc<Manager>,
    policy: ScopePolicy,
}

impl DbScope {
    pub fn new(manager: Arc<Manager>, policy: ScopePolicy) -> Self {
        Self { manager, policy }
    }

    pub fn policy(&self) -> ScopePolicy {
        self.policy
    }
}

fn internal(stage: &'static str, e: keel_db::DbError) -> ApiError {
    tracing::error!(stage, error = %e, "request database scope failed");
    ApiError::InternalServerError(e.to_string())
}

/// Wraps the downstream service in a connection scope, and a transaction
/// scope when the policy asks for one.
///
/// Install with `axum::middleware::from_fn_with_state` as the outermost layer.
pub async fn db_scope_middleware(
    State(scope): State<DbScope>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let conn = scope
        .manager
        .connection()
        .await
        .map_err(|e| internal("acquire", e))?;
    req.extensions_mut().insert::<DbConnection>(conn.handle());

    let response = match scope.policy {
        ScopePolicy::Connection => next.run(req).await,
        ScopePolicy::ConnectionAndTransaction => {
            let tx = conn.transaction().await.map_err(|e| internal("begin", e))?;
            let response = next.run(req).await;

            let status = response.status();
            if status.is_client_error() || status.is_server_error() {
                tracing::debug!(status = status.as_u16(), "error response, rolling back");
                tx.rollback().await.map_err(|e| internal("rollback", e))?;
            } else {
                tx.commit().await.map_err(|e| internal("commit", e))?;
            }
            response
        }
    };

    conn.release();
    Ok(response)
}
