//! # Tests for Handlers
//!
//! This module contains unit tests for API handlers.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    response::Json,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::config::{AppConfig, EphemeralBackend};
use crate::handlers::{healthz, root};
use crate::models::ServiceInfo;
use crate::server::{AppState, build_engine, create_app};

async fn test_state() -> AppState {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    let db = Arc::new(db);

    let config = AppConfig {
        crypto_key: Some(vec![7u8; 32]),
        ephemeral_backend: EphemeralBackend::Memory,
        ..AppConfig::default()
    };
    let engine = build_engine(&config, db.clone(), CancellationToken::new()).unwrap();

    AppState {
        db,
        flows: engine.flows,
        secure_cookies: false,
    }
}

#[tokio::test]
async fn test_root_handler_returns_expected_service_info() {
    let Json(service_info) = root().await;

    assert_eq!(service_info.service, "authproxy");
    assert_eq!(service_info.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_service_info_serializes() {
    let json_value: Value = serde_json::to_value(ServiceInfo::default()).unwrap();

    assert_eq!(json_value["service"], "authproxy");
    assert!(json_value.get("version").is_some());
}

#[tokio::test]
async fn test_healthz_reports_ok() {
    let state = test_state().await;

    let Json(status) = healthz(State(state)).await.unwrap();
    assert_eq!(status.status, "ok");
}

#[tokio::test]
async fn test_router_echoes_trace_id() {
    let app = create_app(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .header("x-trace-id", "trace-abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-trace-id").unwrap(), "trace-abc");
}

#[tokio::test]
async fn test_redirect_with_garbage_token_is_problem_json() {
    let app = create_app(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/oauth2/redirect?token=not-a-jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
    assert!(response.headers().get(header::SET_COOKIE).is_none());
}

#[tokio::test]
async fn test_callback_without_cookie_fails_generically() {
    let app = create_app(test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/oauth2/callback?state=00000000-0000-0000-0000-000000000000&code=abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], "AUTHORIZATION_FAILED");
    assert_eq!(json["message"], "authorization failed");
}
