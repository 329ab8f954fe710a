//! Request scope tests.
//!
//! Every request must release its pooled connection exactly once, commit
//! when the handler succeeds, and roll back when it fails, panics, or is
//! cancelled.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::{get, post},
    Extension, Json, Router,
};
use keel_db::{DbConnection, Manager, Model};
use keel_server::config::DatabaseConfig;
use keel_server::{ApiError, Plugin};
use keel_types::{Field, ModelDef};
use serde_json::{json, Value};
use tower::ServiceExt;

struct Harness {
    _dir: tempfile::TempDir,
    plugin: Plugin,
    model: Model,
    app: Router,
}

impl Harness {
    fn manager(&self) -> Arc<Manager> {
        self.plugin.manager().expect("installed")
    }

    async fn count(&self) -> i64 {
        let conn = self.plugin.connection().await.expect("connection");
        self.model.count(&conn).await.expect("count")
    }
}

async fn insert_row(model: &Model, conn: &DbConnection) -> Result<(), ApiError> {
    let mut row = serde_json::Map::new();
    row.insert("data".to_string(), json!("some"));
    model.insert(conn, row).await?;
    Ok(())
}

async fn harness(auto_connection: bool, auto_transaction: bool) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let plugin = Plugin::new();
    let model = plugin.register(ModelDef::new("test_model").field(Field::char("data")));

    plugin
        .setup(DatabaseConfig {
            connection: format!("sqlite:///{}", dir.path().join("db.sqlite").display()),
            auto_connection,
            auto_transaction,
            ..DatabaseConfig::default()
        })
        .expect("setup");
    plugin.startup().await.expect("startup");
    plugin.create_tables(&[]).await.expect("create tables");

    let ok = model.clone();
    let failing = model.clone();
    let rejected = model.clone();
    let panicking = model.clone();
    let slow = model.clone();

    let router = Router::new()
        .route(
            "/ok",
            post(move |Extension(conn): Extension<DbConnection>| async move {
                insert_row(&ok, &conn).await.map(|()| StatusCode::CREATED)
            }),
        )
        .route(
            "/fail",
            post(move |Extension(conn): Extension<DbConnection>| async move {
                insert_row(&failing, &conn).await?;
                Err::<StatusCode, _>(ApiError::InternalServerError("handler failed".to_string()))
            }),
        )
        .route(
            "/reject",
            post(move |Extension(conn): Extension<DbConnection>| async move {
                insert_row(&rejected, &conn).await?;
                Err::<StatusCode, _>(ApiError::BadRequest("rejected".to_string()))
            }),
        )
        .route(
            "/panic",
            post(move |Extension(conn): Extension<DbConnection>| async move {
                insert_row(&panicking, &conn).await?;
                if conn.is_open() {
                    panic!("handler panicked");
                }
                Ok::<_, ApiError>(StatusCode::OK)
            }),
        )
        .route(
            "/slow",
            post(move |Extension(conn): Extension<DbConnection>| async move {
                insert_row(&slow, &conn).await?;
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, ApiError>(StatusCode::OK)
            }),
        )
        .route(
            "/state",
            get(|Extension(conn): Extension<DbConnection>| async move {
                Json(json!({ "in_transaction": conn.in_transaction() }))
            }),
        );

    let app = plugin.install(router).expect("install");
    Harness {
        _dir: dir,
        plugin,
        model,
        app,
    }
}

fn post_to(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn successful_request_commits() {
    let h = harness(true, true).await;

    let response = h.app.clone().oneshot(post_to("/ok")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    assert_eq!(h.count().await, 1);
    let stats = h.manager().stats();
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 0);
}

#[tokio::test]
async fn failing_request_rolls_back() {
    let h = harness(true, true).await;

    let response = h.app.clone().oneshot(post_to("/fail")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "handler failed");

    let response = h.app.clone().oneshot(post_to("/reject")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(h.count().await, 0);
    let stats = h.manager().stats();
    assert_eq!(stats.commits, 0);
    assert_eq!(stats.rollbacks, 2);
}

#[tokio::test]
async fn every_request_releases_its_connection() {
    let h = harness(true, true).await;
    let before = h.manager().stats();

    for uri in ["/ok", "/fail", "/ok", "/reject"] {
        h.app.clone().oneshot(post_to(uri)).await.unwrap();
    }

    let after = h.manager().stats();
    assert_eq!(after.acquired - before.acquired, 4);
    assert_eq!(after.released - before.released, 4);
    assert_eq!(after.in_use(), 0);
}

#[tokio::test]
async fn panicking_handler_rolls_back_and_releases() {
    let h = harness(true, true).await;

    let app = h.app.clone();
    let outcome = tokio::spawn(async move { app.oneshot(post_to("/panic")).await }).await;
    assert!(outcome.expect_err("handler panics").is_panic());

    assert_eq!(h.count().await, 0);
    let stats = h.manager().stats();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.in_use(), 0);
}

#[tokio::test]
async fn cancelled_request_rolls_back_and_releases() {
    let h = harness(true, true).await;

    let pending = h.app.clone().oneshot(post_to("/slow"));
    let outcome = tokio::time::timeout(Duration::from_millis(300), pending).await;
    assert!(outcome.is_err(), "request should still be running");

    assert_eq!(h.count().await, 0);
    let stats = h.manager().stats();
    assert_eq!(stats.commits, 0);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.in_use(), 0);
}

#[tokio::test]
async fn connection_only_policy_has_no_transaction() {
    let h = harness(true, false).await;

    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/state").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["in_transaction"], false);

    // Without a transaction the insert sticks even though the handler fails.
    h.app.clone().oneshot(post_to("/fail")).await.unwrap();
    assert_eq!(h.count().await, 1);
    assert_eq!(h.manager().stats().in_use(), 0);
}

#[tokio::test]
async fn transaction_policy_exposes_open_transaction() {
    let h = harness(true, true).await;

    let response = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/state").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["in_transaction"], true);
}

#[tokio::test]
async fn disabled_auto_connection_installs_nothing() {
    let h = harness(false, true).await;
    let before = h.manager().stats();

    // The handler's extractor finds no connection.
    let response = h.app.clone().oneshot(post_to("/ok")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let after = h.manager().stats();
    assert_eq!(after.acquired, before.acquired);
}

#[tokio::test]
async fn acquisition_failure_is_a_json_500() {
    let h = harness(true, true).await;
    h.plugin.shutdown().await.expect("shutdown");

    let response = h.app.clone().oneshot(post_to("/ok")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "database is not connected");
}

#[tokio::test]
async fn overlapping_requests_share_the_memory_database() {
    let plugin = Plugin::new();
    let model = plugin.register(ModelDef::new("test_model").field(Field::char("data")));
    plugin
        .setup(DatabaseConfig {
            connection: "sqlite:///:memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .expect("setup");
    plugin.startup().await.expect("startup");
    plugin.create_tables(&[]).await.expect("create tables");

    let writer = model.clone();
    let router = Router::new().route(
        "/write",
        post(move |Extension(conn): Extension<DbConnection>| async move {
            insert_row(&writer, &conn).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ApiError>(StatusCode::OK)
        }),
    );
    let app = plugin.install(router).expect("install");

    let (first, second) = tokio::join!(
        app.clone().oneshot(post_to("/write")),
        app.clone().oneshot(post_to("/write")),
    );
    assert_eq!(first.unwrap().status(), StatusCode::OK);
    assert_eq!(second.unwrap().status(), StatusCode::OK);

    let conn = plugin.connection().await.expect("connection");
    assert_eq!(model.count(&conn).await.expect("count"), 2);
    let stats = plugin.manager().unwrap().stats();
    assert_eq!(stats.commits, 2);
    assert_eq!(stats.rollbacks, 0);
}
