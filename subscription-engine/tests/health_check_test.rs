//! Health, readiness and metrics endpoints.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{test_config, test_policy, ScriptedGateway, TestApp};
use reqwest::Client;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use subscription_engine::engine::Engine;
use subscription_engine::services::{init_metrics, PgStore, SystemClock};
use subscription_engine::startup::{router, AppState};
use tower::ServiceExt;

/// State whose pool points at a port nothing listens on. The pool connects
/// lazily, so building it succeeds and every query fails.
fn unreachable_database_state() -> AppState {
    init_metrics();

    let url = "postgres://postgres@127.0.0.1:1/subscriptions";
    let pool = PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(1))
        .connect_lazy(url)
        .unwrap();
    let store = Arc::new(PgStore::from_pool(pool));
    let engine = Engine::new(
        store.clone(),
        Arc::new(SystemClock),
        test_policy(),
        Arc::new(ScriptedGateway::new()),
    );

    AppState {
        config: test_config(url),
        store,
        engine,
    }
}

#[tokio::test]
async fn health_reports_an_unreachable_database() {
    let response = router(unreachable_database_state())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["service"], "subscription-engine");
}

#[tokio::test]
async fn readiness_fails_without_a_database() {
    let response = router(unreachable_database_state())
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn metrics_are_served_without_a_database() {
    let response = router(unreachable_database_state())
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .header("x-request-id", "req-metrics-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap_or("").contains("text/plain"))
        .unwrap_or(false));
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req-metrics-1"
    );
}

#[tokio::test]
async fn health_check_works() {
    let Some(app) = TestApp::spawn().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let client = Client::new();

    let response = client
        .get(format!("{}/health", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "subscription-engine");
}

#[tokio::test]
async fn readiness_check_works() {
    let Some(app) = TestApp::spawn().await else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return;
    };
    let client = Client::new();

    let response = client
        .get(format!("{}/ready", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
}
