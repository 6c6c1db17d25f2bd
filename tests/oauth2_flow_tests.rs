//! Integration tests for the OAuth2 authorization code flow, from the public
//! redirect link through the provider callback.

use anyhow::Result;
use authproxy::error::Error;
use authproxy::models::connection::{self, ConnectionState};
use authproxy::oauth2::CallbackParams;
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod test_utils;
use test_utils::{TestEngine, build_test_engine, oauth2_definition};

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn created_connection(engine: &TestEngine, server: &MockServer) -> Result<connection::Model> {
    let version = engine
        .publish(Uuid::new_v4(), 1, oauth2_definition(&server.uri()))
        .await?;
    engine.create_connection(&version).await
}

/// Runs the proxy-side half of the flow and returns the provider state id.
async fn start_flow(
    engine: &TestEngine,
    connection_id: Uuid,
    actor_id: Uuid,
    return_to: Option<Url>,
) -> Result<String> {
    let flow = engine.flows.for_connection(connection_id).await?;
    let public_url = flow
        .set_state_and_generate_public_url(actor_id, return_to)
        .await?;
    let token = query_param(&public_url, "token").expect("redirect token");

    let outcome = engine.flows.handle_redirect(&token).await?;
    Ok(query_param(&outcome.authorization_url, "state").expect("state param"))
}

async fn mock_token_exchange(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-xyz",
            "refresh_token": "refresh-xyz",
            "expires_in": 3600,
            "token_type": "Bearer",
            "scope": "read"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn params(state: &str) -> CallbackParams {
    CallbackParams {
        state: Some(state.to_string()),
        code: Some("auth-code".to_string()),
        ..CallbackParams::default()
    }
}

#[tokio::test]
async fn public_url_points_at_the_redirect_endpoint() -> Result<()> {
    let server = MockServer::start().await;
    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;

    let flow = engine.flows.for_connection(connection.id).await?;
    let url = flow
        .set_state_and_generate_public_url(Uuid::new_v4(), None)
        .await?;

    assert_eq!(url.origin().ascii_serialization(), "http://localhost:8080");
    assert_eq!(url.path(), "/oauth2/redirect");
    assert!(query_param(&url, "token").is_some());
    Ok(())
}

#[tokio::test]
async fn redirect_builds_the_authorization_url() -> Result<()> {
    let server = MockServer::start().await;
    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;
    let actor = Uuid::new_v4();

    let flow = engine.flows.for_connection(connection.id).await?;
    let public_url = flow.set_state_and_generate_public_url(actor, None).await?;
    let token = query_param(&public_url, "token").expect("token");

    let outcome = engine.flows.handle_redirect(&token).await?;
    let auth = &outcome.authorization_url;

    assert_eq!(auth.path(), "/authorize");
    assert_eq!(query_param(auth, "client_id").as_deref(), Some("client-123"));
    assert_eq!(query_param(auth, "response_type").as_deref(), Some("code"));
    assert_eq!(query_param(auth, "access_type").as_deref(), Some("offline"));
    assert_eq!(query_param(auth, "scope").as_deref(), Some("read write"));
    assert_eq!(
        query_param(auth, "redirect_uri").as_deref(),
        Some("http://localhost:8080/oauth2/callback")
    );
    let state_id = Uuid::parse_str(&query_param(auth, "state").expect("state"))?;

    let claims = engine
        .flows
        .verify_callback_token(&outcome.callback_token)
        .await?;
    assert_eq!(claims.sub, actor);
    assert_eq!(claims.sid, state_id);
    assert!(outcome.callback_token_ttl.as_secs() >= 300);
    Ok(())
}

#[tokio::test]
async fn redirect_token_cannot_be_replayed() -> Result<()> {
    let server = MockServer::start().await;
    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;

    let flow = engine.flows.for_connection(connection.id).await?;
    let public_url = flow
        .set_state_and_generate_public_url(Uuid::new_v4(), None)
        .await?;
    let token = query_param(&public_url, "token").expect("token");

    engine.flows.handle_redirect(&token).await?;
    let err = engine.flows.handle_redirect(&token).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn callback_exchanges_code_and_marks_connection_ready() -> Result<()> {
    let server = MockServer::start().await;
    mock_token_exchange(&server, 1).await;

    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;
    let actor = Uuid::new_v4();
    let return_to = Url::parse("https://app.example.com/done")?;

    let state = start_flow(&engine, connection.id, actor, Some(return_to.clone())).await?;
    let outcome = engine
        .flows
        .callback_from_3rd_party(actor, &params(&state))
        .await?;

    assert_eq!(outcome.connection_id, connection.id);
    assert_eq!(outcome.return_to_url, Some(return_to));
    assert!(!outcome.cancel_session_after_auth);

    let ready = engine.connections.get(connection.id).await?;
    assert_eq!(ready.state, ConnectionState::Ready);

    let token = engine.tokens.get(connection.id).await?;
    assert_eq!(engine.manager.decrypt_access_token(&token)?, "access-xyz");
    assert_eq!(
        engine.manager.decrypt_refresh_token(&token)?.as_deref(),
        Some("refresh-xyz")
    );
    assert_eq!(token.scope_list(), vec!["read".to_string()]);
    assert!(token.access_token_expires_at.is_some());
    Ok(())
}

#[tokio::test]
async fn state_is_single_use() -> Result<()> {
    let server = MockServer::start().await;
    mock_token_exchange(&server, 1).await;

    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;
    let actor = Uuid::new_v4();

    let state = start_flow(&engine, connection.id, actor, None).await?;
    engine
        .flows
        .callback_from_3rd_party(actor, &params(&state))
        .await?;

    let err = engine
        .flows
        .callback_from_3rd_party(actor, &params(&state))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthorizationFailed(_)));
    assert_eq!(err.to_string(), "authorization failed");
    Ok(())
}

#[tokio::test]
async fn concurrent_callbacks_consume_state_once() -> Result<()> {
    let server = MockServer::start().await;
    mock_token_exchange(&server, 1).await;

    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;
    let actor = Uuid::new_v4();

    let state = start_flow(&engine, connection.id, actor, None).await?;
    let callback = params(&state);

    let (first, second) = tokio::join!(
        engine.flows.callback_from_3rd_party(actor, &callback),
        engine.flows.callback_from_3rd_party(actor, &callback),
    );

    assert_eq!(
        [first.is_ok(), second.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn actor_mismatch_is_rejected_without_consuming_state() -> Result<()> {
    let server = MockServer::start().await;
    mock_token_exchange(&server, 1).await;

    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;
    let actor = Uuid::new_v4();

    let state = start_flow(&engine, connection.id, actor, None).await?;

    let err = engine
        .flows
        .callback_from_3rd_party(Uuid::new_v4(), &params(&state))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthorizationFailed(_)));

    engine
        .flows
        .callback_from_3rd_party(actor, &params(&state))
        .await?;
    Ok(())
}

#[tokio::test]
async fn malformed_or_missing_state_fails() -> Result<()> {
    let engine = build_test_engine().await?;
    let actor = Uuid::new_v4();

    for state in [Some("not-a-uuid".to_string()), None] {
        let err = engine
            .flows
            .callback_from_3rd_party(
                actor,
                &CallbackParams {
                    state,
                    code: Some("auth-code".to_string()),
                    ..CallbackParams::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthorizationFailed(_)));
    }

    let err = engine
        .flows
        .callback_from_3rd_party(actor, &params(&Uuid::new_v4().to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthorizationFailed(_)));
    Ok(())
}

#[tokio::test]
async fn provider_error_skips_the_exchange() -> Result<()> {
    let server = MockServer::start().await;
    mock_token_exchange(&server, 0).await;

    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;
    let actor = Uuid::new_v4();

    let state = start_flow(&engine, connection.id, actor, None).await?;
    let err = engine
        .flows
        .callback_from_3rd_party(
            actor,
            &CallbackParams {
                state: Some(state),
                error: Some("access_denied".to_string()),
                error_description: Some("user said no".to_string()),
                ..CallbackParams::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthorizationFailed(_)));

    let unchanged = engine.connections.get(connection.id).await?;
    assert_eq!(unchanged.state, ConnectionState::Created);
    Ok(())
}

#[tokio::test]
async fn failed_exchange_leaves_connection_untouched() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;
    let actor = Uuid::new_v4();

    let state = start_flow(&engine, connection.id, actor, None).await?;
    let err = engine
        .flows
        .callback_from_3rd_party(actor, &params(&state))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthorizationFailed(_)));

    assert_eq!(
        engine.connections.get(connection.id).await?.state,
        ConnectionState::Created
    );
    assert!(engine.tokens.get(connection.id).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn cancel_session_flag_is_reported_on_completion() -> Result<()> {
    let server = MockServer::start().await;
    mock_token_exchange(&server, 1).await;

    let engine = build_test_engine().await?;
    let connection = created_connection(&engine, &server).await?;
    let actor = Uuid::new_v4();

    let state = start_flow(&engine, connection.id, actor, None).await?;
    let state_id = Uuid::parse_str(&state)?;

    let err = engine
        .flows
        .record_cancel_session_after_auth(state_id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    engine
        .flows
        .record_cancel_session_after_auth(state_id, actor)
        .await?;

    let outcome = engine
        .flows
        .callback_from_3rd_party(actor, &params(&state))
        .await?;
    assert!(outcome.cancel_session_after_auth);
    Ok(())
}

#[tokio::test]
async fn disconnect_revokes_then_drops_tokens() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let engine = build_test_engine().await?;
    let connection = engine
        .ready_connection(oauth2_definition(&server.uri()))
        .await?;
    engine
        .seed_token(connection.id, "access-1", Some("refresh-1"), Some(3600))
        .await?;

    let flow = engine.flows.for_connection(connection.id).await?;
    assert!(flow.supports_revoke_tokens());
    flow.disconnect().await?;

    let disconnected = engine.connections.get(connection.id).await?;
    assert_eq!(disconnected.state, ConnectionState::Disconnected);
    assert!(engine.tokens.get(connection.id).await.unwrap_err().is_not_found());
    Ok(())
}

#[tokio::test]
async fn disconnect_survives_revocation_failure() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let engine = build_test_engine().await?;
    let connection = engine
        .ready_connection(oauth2_definition(&server.uri()))
        .await?;
    engine
        .seed_token(connection.id, "access-1", Some("refresh-1"), Some(3600))
        .await?;

    let flow = engine.flows.for_connection(connection.id).await?;
    flow.disconnect().await?;

    assert_eq!(
        engine.connections.get(connection.id).await?.state,
        ConnectionState::Disconnected
    );
    assert!(engine.tokens.get(connection.id).await.unwrap_err().is_not_found());
    Ok(())
}
