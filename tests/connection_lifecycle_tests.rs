//! Integration tests for connection creation, state changes and deletion.

use std::collections::BTreeMap;

use anyhow::Result;
use authproxy::error::Error;
use authproxy::models::connection::ConnectionState;
use authproxy::repositories::NewConnection;
use uuid::Uuid;

mod test_utils;
use test_utils::{build_test_engine, oauth2_definition};

#[tokio::test]
async fn create_starts_in_created_state() -> Result<()> {
    let engine = build_test_engine().await?;
    let version = engine
        .publish(Uuid::new_v4(), 1, oauth2_definition("https://p.example.com"))
        .await?;

    let mut labels = BTreeMap::new();
    labels.insert("team".to_string(), "growth".to_string());
    let connection = engine
        .connections
        .create(NewConnection {
            namespace: "root.acme".to_string(),
            connector_id: version.connector_id,
            connector_version: version.version,
            labels,
        })
        .await?;

    assert_eq!(connection.state, ConnectionState::Created);
    assert_eq!(connection.connector_version, 1);
    assert_eq!(connection.labels["team"], "growth");

    let fetched = engine.connections.get(connection.id).await?;
    assert_eq!(fetched.id, connection.id);
    Ok(())
}

#[tokio::test]
async fn create_rejects_unknown_version_and_bad_input() -> Result<()> {
    let engine = build_test_engine().await?;
    let version = engine
        .publish(Uuid::new_v4(), 1, oauth2_definition("https://p.example.com"))
        .await?;

    let err = engine
        .connections
        .create(NewConnection {
            namespace: "root.acme".to_string(),
            connector_id: version.connector_id,
            connector_version: 7,
            labels: BTreeMap::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = engine
        .connections
        .create(NewConnection {
            namespace: "Root..Acme".to_string(),
            connector_id: version.connector_id,
            connector_version: 1,
            labels: BTreeMap::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let mut labels = BTreeMap::new();
    labels.insert("-bad-".to_string(), "x".to_string());
    let err = engine
        .connections
        .create(NewConnection {
            namespace: "root.acme".to_string(),
            connector_id: version.connector_id,
            connector_version: 1,
            labels,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn set_state_moves_forward_and_reports_missing() -> Result<()> {
    let engine = build_test_engine().await?;
    let version = engine
        .publish(Uuid::new_v4(), 1, oauth2_definition("https://p.example.com"))
        .await?;
    let connection = engine.create_connection(&version).await?;

    let ready = engine
        .connections
        .set_state(connection.id, ConnectionState::Ready)
        .await?;
    assert_eq!(ready.state, ConnectionState::Ready);
    assert!(ready.updated_at >= connection.updated_at);

    let disabled = engine
        .connections
        .set_state(connection.id, ConnectionState::Disabled)
        .await?;
    assert_eq!(disabled.state, ConnectionState::Disabled);

    let err = engine
        .connections
        .set_state(Uuid::new_v4(), ConnectionState::Ready)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn disconnect_phase_is_not_reversible() -> Result<()> {
    let engine = build_test_engine().await?;
    let version = engine
        .publish(Uuid::new_v4(), 1, oauth2_definition("https://p.example.com"))
        .await?;
    let connection = engine.create_connection(&version).await?;

    engine
        .connections
        .set_state(connection.id, ConnectionState::Disconnecting)
        .await?;

    let err = engine
        .connections
        .set_state(connection.id, ConnectionState::Ready)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let done = engine
        .connections
        .set_state(connection.id, ConnectionState::Disconnected)
        .await?;
    assert_eq!(done.state, ConnectionState::Disconnected);

    let err = engine
        .connections
        .set_state(connection.id, ConnectionState::Created)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn delete_is_soft_and_idempotent() -> Result<()> {
    let engine = build_test_engine().await?;
    let version = engine
        .publish(Uuid::new_v4(), 1, oauth2_definition("https://p.example.com"))
        .await?;
    let connection = engine.create_connection(&version).await?;

    engine.connections.delete(connection.id).await?;
    engine.connections.delete(connection.id).await?;
    engine.connections.delete(Uuid::new_v4()).await?;

    let err = engine.connections.get(connection.id).await.unwrap_err();
    assert!(err.is_not_found());

    let err = engine
        .connections
        .set_state(connection.id, ConnectionState::Ready)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}
