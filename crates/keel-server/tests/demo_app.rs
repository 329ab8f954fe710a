use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use keel_server::app::{app, DemoState};
use keel_server::config::DatabaseConfig;
use keel_server::Plugin;
use serde_json::Value;
use tower::ServiceExt;

async fn setup_app() -> (Plugin, Router) {
    let plugin = Plugin::with_config(DatabaseConfig {
        connection: "sqlite:///:memory:".to_string(),
        ..DatabaseConfig::default()
    })
    .expect("setup");
    let router = app(DemoState::new(plugin.clone())).expect("app");
    plugin.startup().await.expect("startup");
    plugin.create_tables(&[]).await.expect("create tables");
    (plugin, router)
}

async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_check_returns_ok() {
    let (_plugin, app) = setup_app().await;

    let (status, json) = call(&app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["database"], true);
}

#[tokio::test]
async fn generate_list_and_clean() {
    let (plugin, app) = setup_app().await;

    let (status, json) = call(&app, "GET", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, Value::Array(Vec::new()));

    let (status, created) = call(&app, "POST", "/generate").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["content"].as_str().unwrap().len(), 32);
    assert!(created["created"].as_str().unwrap().ends_with('Z'));
    call(&app, "POST", "/generate").await;

    let (_, json) = call(&app, "GET", "/").await;
    let items = json.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"], created["id"]);

    let (status, json) = call(&app, "POST", "/clean").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["deleted"], 2);

    let (_, json) = call(&app, "GET", "/").await;
    assert_eq!(json, Value::Array(Vec::new()));

    let stats = plugin.manager().unwrap().stats();
    assert_eq!(stats.in_use(), 0);
    assert_eq!(stats.commits, 6);
}

#[tokio::test]
async fn routes_work_without_request_scope() {
    let plugin = Plugin::with_config(DatabaseConfig {
        connection: "sqlite:///:memory:".to_string(),
        auto_connection: false,
        ..DatabaseConfig::default()
    })
    .expect("setup");
    let app = app(DemoState::new(plugin.clone())).expect("app");
    plugin.startup().await.expect("startup");
    plugin.create_tables(&[]).await.expect("create tables");

    let (status, created) = call(&app, "POST", "/generate").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["content"].as_str().unwrap().len(), 32);

    let (status, json) = call(&app, "GET", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 1);

    let (_, json) = call(&app, "POST", "/clean").await;
    assert_eq!(json["deleted"], 1);

    let stats = plugin.manager().unwrap().stats();
    assert_eq!(stats.in_use(), 0);
    assert_eq!(stats.commits, 0);
}
