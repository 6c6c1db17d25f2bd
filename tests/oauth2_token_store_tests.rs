//! Integration tests for the OAuth2 token store.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use authproxy::crypto::EncryptService;
use authproxy::models::connection::ConnectionState;
use authproxy::repositories::NewOAuth2Token;
use uuid::Uuid;

mod test_utils;
use test_utils::{build_test_engine, oauth2_definition};

#[tokio::test]
async fn insert_replaces_the_live_token() -> Result<()> {
    let engine = build_test_engine().await?;
    let connection = engine
        .ready_connection(oauth2_definition("https://p.example.com"))
        .await?;

    let first = engine
        .seed_token(connection.id, "access-1", Some("refresh-1"), Some(3600))
        .await?;
    let second = engine
        .seed_token(connection.id, "access-2", Some("refresh-2"), Some(3600))
        .await?;

    let live = engine.tokens.get(connection.id).await?;
    assert_eq!(live.id, second.id);
    assert_ne!(live.id, first.id);
    assert_eq!(engine.manager.decrypt_access_token(&live)?, "access-2");
    Ok(())
}

#[tokio::test]
async fn get_without_token_is_not_found() -> Result<()> {
    let engine = build_test_engine().await?;
    let err = engine.tokens.get(Uuid::new_v4()).await.unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn delete_all_for_connection_hides_every_token() -> Result<()> {
    let engine = build_test_engine().await?;
    let connection = engine
        .ready_connection(oauth2_definition("https://p.example.com"))
        .await?;
    engine
        .seed_token(connection.id, "access-1", None, Some(3600))
        .await?;

    let deleted = engine.tokens.delete_all_for_connection(connection.id).await?;
    assert_eq!(deleted, 1);
    assert!(engine.tokens.get(connection.id).await.unwrap_err().is_not_found());

    assert_eq!(engine.tokens.delete_all_for_connection(connection.id).await?, 0);
    Ok(())
}

#[tokio::test]
async fn delete_single_token_is_idempotent() -> Result<()> {
    let engine = build_test_engine().await?;
    let connection = engine
        .ready_connection(oauth2_definition("https://p.example.com"))
        .await?;
    let token = engine
        .seed_token(connection.id, "access-1", None, Some(3600))
        .await?;

    engine.tokens.delete(token.id).await?;
    engine.tokens.delete(token.id).await?;
    assert!(engine.tokens.get(connection.id).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn scopes_are_stored_as_a_list() -> Result<()> {
    let engine = build_test_engine().await?;
    let connection = engine
        .ready_connection(oauth2_definition("https://p.example.com"))
        .await?;

    let token = engine
        .tokens
        .insert(NewOAuth2Token {
            connection_id: connection.id,
            refreshed_from_id: None,
            encrypted_access_token: engine
                .encryptor
                .encrypt_for_connection(connection.id, b"access")?,
            encrypted_refresh_token: None,
            access_token_expires_at: None,
            scopes: vec!["a".to_string(), "b".to_string()],
        })
        .await?;

    assert_eq!(token.scope_list(), vec!["a".to_string(), "b".to_string()]);
    assert!(token.access_token_expires_at.is_none());
    Ok(())
}

#[tokio::test]
async fn enumerate_filters_by_window_state_and_expiry() -> Result<()> {
    let engine = build_test_engine().await?;
    let definition = oauth2_definition("https://p.example.com");

    let expiring = engine.ready_connection(definition.clone()).await?;
    engine
        .seed_token(expiring.id, "a", Some("r"), Some(60))
        .await?;

    let expired = engine.ready_connection(definition.clone()).await?;
    engine
        .seed_token(expired.id, "a", Some("r"), Some(-60))
        .await?;

    let later = engine.ready_connection(definition.clone()).await?;
    engine
        .seed_token(later.id, "a", Some("r"), Some(7200))
        .await?;

    let never = engine.ready_connection(definition.clone()).await?;
    engine.seed_token(never.id, "a", Some("r"), None).await?;

    let disabled = engine.ready_connection(definition.clone()).await?;
    engine
        .seed_token(disabled.id, "a", Some("r"), Some(60))
        .await?;
    engine
        .connections
        .set_state(disabled.id, ConnectionState::Disabled)
        .await?;

    let deleted = engine.ready_connection(definition).await?;
    engine
        .seed_token(deleted.id, "a", Some("r"), Some(60))
        .await?;
    engine.connections.delete(deleted.id).await?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let delivered = engine
        .tokens
        .enumerate_expiring_within(chrono::Duration::seconds(600), move |page| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .unwrap()
                    .extend(page.into_iter().map(|(_, connection)| connection.id));
                Ok(ControlFlow::Continue(()))
            }
        })
        .await?;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(delivered, 2);
    // Ordered by expiry, already expired first.
    assert_eq!(seen, vec![expired.id, expiring.id]);
    Ok(())
}

#[tokio::test]
async fn enumerate_pages_and_honours_break() -> Result<()> {
    let engine = build_test_engine().await?;
    let definition = oauth2_definition("https://p.example.com");

    let total = 105;
    for i in 0..total {
        let connection = engine.ready_connection(definition.clone()).await?;
        engine
            .seed_token(connection.id, "a", None, Some(10 + i))
            .await?;
    }

    let pages = Arc::new(Mutex::new(Vec::new()));
    let sink = pages.clone();
    let delivered = engine
        .tokens
        .enumerate_expiring_within(chrono::Duration::seconds(3600), move |page| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(page.len());
                Ok(ControlFlow::Continue(()))
            }
        })
        .await?;
    assert_eq!(delivered, total as u64);
    assert_eq!(*pages.lock().unwrap(), vec![100, 5]);

    let delivered = engine
        .tokens
        .enumerate_expiring_within(chrono::Duration::seconds(3600), |_page| async {
            Ok(ControlFlow::Break(()))
        })
        .await?;
    assert_eq!(delivered, 100);
    Ok(())
}

#[tokio::test]
async fn enumerate_reaches_every_row_while_pages_are_being_refreshed() -> Result<()> {
    let engine = build_test_engine().await?;
    let definition = oauth2_definition("https://p.example.com");

    let total = 250;
    for i in 0..total {
        let connection = engine.ready_connection(definition.clone()).await?;
        engine
            .seed_token(connection.id, "a", None, Some(10 + i))
            .await?;
    }

    // Each delivered token is replaced by one far outside the window, as the
    // refresh worker does while the sweep is still paging.
    let tokens = engine.tokens.clone();
    let encryptor = engine.encryptor.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let delivered = engine
        .tokens
        .enumerate_expiring_within(chrono::Duration::seconds(3600), move |page| {
            let tokens = tokens.clone();
            let encryptor = encryptor.clone();
            let sink = sink.clone();
            async move {
                for (token, _) in page {
                    sink.lock().unwrap().push(token.connection_id);
                    tokens
                        .insert(NewOAuth2Token {
                            connection_id: token.connection_id,
                            refreshed_from_id: Some(token.id),
                            encrypted_access_token: encryptor
                                .encrypt_for_connection(token.connection_id, b"fresh")?,
                            encrypted_refresh_token: None,
                            access_token_expires_at: Some(
                                chrono::Utc::now() + chrono::Duration::days(1),
                            ),
                            scopes: vec![],
                        })
                        .await?;
                }
                Ok(ControlFlow::Continue(()))
            }
        })
        .await?;

    assert_eq!(delivered, total as u64);
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), total as usize);
    Ok(())
}
