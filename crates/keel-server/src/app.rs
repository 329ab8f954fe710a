//! Demo application: a list of generated data items.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use keel_db::{ConnectionScope, DbConnection, Model};
use keel_types::{Field, ModelDef};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::{ApiError, PluginError};
use crate::plugin::Plugin;

/// Table of the demo model.
pub const DATA_ITEMS: &str = "data_items";

/// Schema of the demo model.
pub fn data_items() -> ModelDef {
    ModelDef::new(DATA_ITEMS)
        .field(Field::datetime_tz("created").default_now())
        .field(Field::char("content"))
}

/// State shared by the demo handlers.
#[derive(Clone)]
pub struct DemoState {
    pub plugin: Plugin,
    pub items: Model,
}

impl DemoState {
    /// Registers the demo model with `plugin`.
    pub fn new(plugin: Plugin) -> Self {
        let items = plugin.register(data_items());
        Self { plugin, items }
    }
}

fn random_content() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// The request's connection, or a fresh scope when `auto_connection` is off.
async fn request_connection(
    state: &DemoState,
    scoped: Option<Extension<DbConnection>>,
) -> Result<(DbConnection, Option<ConnectionScope>), ApiError> {
    match scoped {
        Some(Extension(conn)) => Ok((conn, None)),
        None => {
            let scope = state.plugin.connection().await?;
            Ok((scope.handle(), Some(scope)))
        }
    }
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<DemoState>>) -> Json<Value> {
    let connected = state
        .plugin
        .manager()
        .map(|m| m.is_connected())
        .unwrap_or(false);
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "database": connected,
    }))
}

/// `GET /`: every item, oldest first.
async fn list_items(
    Extension(state): Extension<Arc<DemoState>>,
    scoped: Option<Extension<DbConnection>>,
) -> Result<Json<Value>, ApiError> {
    let (conn, _scope) = request_connection(&state, scoped).await?;
    let rows = state.items.fetch_all(&conn).await?;
    Ok(Json(Value::Array(rows.into_iter().map(Value::Object).collect())))
}

/// `POST /generate`: inserts an item with random content.
async fn generate_item(
    Extension(state): Extension<Arc<DemoState>>,
    scoped: Option<Extension<DbConnection>>,
) -> Result<Json<Value>, ApiError> {
    let (conn, _scope) = request_connection(&state, scoped).await?;
    let mut row = serde_json::Map::new();
    row.insert("content".to_string(), Value::String(random_content()));
    let id = state.items.insert(&conn, row).await?;
    tracing::debug!(id, "data item generated");
    let item = state.items.get(&conn, id).await?;
    Ok(Json(Value::Object(item)))
}

/// `POST /clean`: deletes every item.
async fn clean_items(
    Extension(state): Extension<Arc<DemoState>>,
    scoped: Option<Extension<DbConnection>>,
) -> Result<Json<Value>, ApiError> {
    let (conn, _scope) = request_connection(&state, scoped).await?;
    let deleted = state.items.delete_all(&conn).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

/// Builds the demo router with the plugin's request scope applied last.
pub fn app(state: DemoState) -> Result<Router, PluginError> {
    let plugin = state.plugin.clone();
    let router = Router::new()
        .route("/", get(list_items))
        .route("/generate", post(generate_item))
        .route("/clean", post(clean_items))
        .route("/health", get(health))
        .layer(Extension(Arc::new(state)))
        .layer(TraceLayer::new_for_http());
    plugin.install(router)
}
