//! # OAuth2 Authorization Flow
//!
//! Drives one authorization attempt from the public redirect link to the
//! provider callback:
//!
//! 1. [`ConnectionFlow::set_state_and_generate_public_url`] stores an
//!    [`OAuth2State`] and returns a link to the proxy's redirect endpoint
//!    carrying a signed token naming the actor.
//! 2. [`OAuth2Flows::handle_redirect`] verifies that token and builds the
//!    provider's authorization URL, plus a callback cookie token.
//! 3. [`OAuth2Flows::callback_from_3rd_party`] validates and consumes the
//!    state, exchanges the code and marks the connection ready.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::provider::ProviderClient;
use super::redirect_token::{RedirectClaims, RedirectTokenSigner, TokenAudience};
use super::state::{OAuth2State, StateStore};
use super::tokens::{RevokeOutcome, TokenContext, TokenManager};
use crate::connectors::{AuthType, OAuth2Definition};
use crate::error::{Error, Result};
use crate::models::connection::ConnectionState;
use crate::repositories::{ConnectionRepository, ConnectorVersionRepository};

pub const REDIRECT_PATH: &str = "/oauth2/redirect";
pub const CALLBACK_PATH: &str = "/oauth2/callback";

/// Query parameters the provider sends back to the callback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Result of [`OAuth2Flows::handle_redirect`].
#[derive(Debug, Clone)]
pub struct RedirectOutcome {
    pub authorization_url: Url,
    /// Signed token for the callback cookie
    pub callback_token: String,
    pub callback_token_ttl: Duration,
}

/// Result of a successful callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub connection_id: Uuid,
    pub return_to_url: Option<Url>,
    pub cancel_session_after_auth: bool,
}

struct FlowInner {
    public_base_url: Url,
    round_trip_timeout: Duration,
    versions: ConnectorVersionRepository,
    connections: ConnectionRepository,
    states: StateStore,
    signer: RedirectTokenSigner,
    tokens: TokenManager,
    provider: ProviderClient,
}

/// Entry point for every OAuth2 flow operation.
#[derive(Clone)]
pub struct OAuth2Flows {
    inner: Arc<FlowInner>,
}

impl OAuth2Flows {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        public_base_url: Url,
        round_trip_timeout: Duration,
        versions: ConnectorVersionRepository,
        connections: ConnectionRepository,
        states: StateStore,
        signer: RedirectTokenSigner,
        tokens: TokenManager,
        provider: ProviderClient,
    ) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                public_base_url,
                round_trip_timeout,
                versions,
                connections,
                states,
                signer,
                tokens,
                provider,
            }),
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn states(&self) -> &StateStore {
        &self.inner.states
    }

    /// `redirect_uri` registered with every provider.
    pub fn callback_url(&self) -> Result<Url> {
        self.public_url(CALLBACK_PATH)
    }

    fn public_url(&self, path: &str) -> Result<Url> {
        self.inner
            .public_base_url
            .join(path)
            .map_err(|e| Error::Validation(format!("invalid public base url: {}", e)))
    }

    /// Binds a flow to one live OAuth2 connection.
    pub async fn for_connection(&self, connection_id: Uuid) -> Result<ConnectionFlow> {
        let context = self.inner.tokens.load_context(connection_id).await?;
        Ok(ConnectionFlow {
            flows: self.clone(),
            context,
        })
    }

    /// Verifies the redirect token and builds the provider authorization URL.
    #[instrument(skip_all)]
    pub async fn handle_redirect(&self, token: &str) -> Result<RedirectOutcome> {
        let claims = self
            .inner
            .signer
            .verify(TokenAudience::Redirect, token)
            .await?;

        let state = self.inner.states.get(claims.sid).await?;
        if state.actor_id != claims.sub || state.is_expired() {
            return Err(Error::Validation(
                "redirect token does not match a live oauth2 state".into(),
            ));
        }

        let definition = self
            .oauth2_definition(state.connector_id, state.connector_version)
            .await?;
        let authorization_url = self.authorization_url(&definition, state.id)?;

        let callback_token =
            self.inner
                .signer
                .issue(TokenAudience::Callback, state.actor_id, state.id)?;

        info!(
            state_id = %state.id,
            connection_id = %state.connection_id,
            connector_id = %state.connector_id,
            "Redirecting to provider"
        );

        Ok(RedirectOutcome {
            authorization_url,
            callback_token,
            callback_token_ttl: self.inner.signer.ttl(TokenAudience::Callback),
        })
    }

    /// Verifies the callback cookie token. Any failure is an authorization
    /// failure.
    pub async fn verify_callback_token(&self, token: &str) -> Result<RedirectClaims> {
        self.inner
            .signer
            .verify(TokenAudience::Callback, token)
            .await
            .map_err(|e| Error::AuthorizationFailed(e.to_string()))
    }

    /// Validates and consumes the state, exchanges the code and stores the
    /// token. Every failure is reported as [`Error::AuthorizationFailed`].
    pub async fn callback_from_3rd_party(
        &self,
        actor_id: Uuid,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome> {
        let result = self.run_callback(actor_id, params).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter!("oauth2_callback_total", "outcome" => outcome).increment(1);

        result.map_err(|err| match err {
            Error::AuthorizationFailed(reason) => Error::AuthorizationFailed(reason),
            other => Error::AuthorizationFailed(other.to_string()),
        })
    }

    #[instrument(skip_all, fields(actor_id = %actor_id))]
    async fn run_callback(&self, actor_id: Uuid, params: &CallbackParams) -> Result<CallbackOutcome> {
        let raw_state = params
            .state
            .as_deref()
            .ok_or_else(|| Error::AuthorizationFailed("missing state parameter".into()))?;
        let state_id = Uuid::parse_str(raw_state)
            .map_err(|_| Error::AuthorizationFailed("malformed state parameter".into()))?;

        let state = self.inner.states.get(state_id).await?;
        self.validate_state(&state, actor_id)?;

        let definition = self
            .oauth2_definition(state.connector_id, state.connector_version)
            .await?;

        if let Some(error) = &params.error {
            return Err(Error::AuthorizationFailed(format!(
                "provider returned error '{}': {}",
                error,
                params.error_description.as_deref().unwrap_or("")
            )));
        }
        let code = params
            .code
            .as_deref()
            .filter(|code| !code.is_empty())
            .ok_or_else(|| Error::AuthorizationFailed("missing code parameter".into()))?;

        self.inner.states.consume(state.id).await?;

        let redirect_uri = self.callback_url()?;
        let response = self
            .inner
            .provider
            .exchange_code(&definition, code, redirect_uri.as_str())
            .await?;

        let token = self
            .inner
            .tokens
            .create_db_token_from_response(
                state.connection_id,
                &response,
                &definition.scopes,
                None,
            )
            .await?;

        self.inner
            .connections
            .set_state(state.connection_id, ConnectionState::Ready)
            .await?;

        info!(
            state_id = %state.id,
            connection_id = %state.connection_id,
            token_id = %token.id,
            "OAuth2 authorization completed"
        );

        Ok(CallbackOutcome {
            connection_id: state.connection_id,
            return_to_url: state.return_to_url,
            cancel_session_after_auth: state.cancel_session_after_auth,
        })
    }

    fn validate_state(&self, state: &OAuth2State, actor_id: Uuid) -> Result<()> {
        if !state.is_valid() {
            return Err(Error::AuthorizationFailed(format!(
                "oauth2 state {} is incomplete",
                state.id
            )));
        }
        if state.is_expired() {
            return Err(Error::AuthorizationFailed(format!(
                "oauth2 state {} expired",
                state.id
            )));
        }
        if state.actor_id != actor_id {
            return Err(Error::AuthorizationFailed(format!(
                "actor mismatch for oauth2 state {}",
                state.id
            )));
        }
        Ok(())
    }

    /// Flags a pending state so the caller's session is ended once the
    /// callback completes.
    pub async fn record_cancel_session_after_auth(
        &self,
        state_id: Uuid,
        actor_id: Uuid,
    ) -> Result<()> {
        self.inner
            .states
            .record_cancel_session_after_auth(state_id, actor_id)
            .await?;
        Ok(())
    }

    async fn oauth2_definition(&self, connector_id: Uuid, version: i64) -> Result<OAuth2Definition> {
        let model = self
            .inner
            .versions
            .get(connector_id, version)
            .await?
            .ok_or_else(|| Error::not_found("connector version", format!("{}@{}", connector_id, version)))?;
        let definition = self.inner.versions.load_definition(&model)?;
        if definition.auth_type() != AuthType::OAuth2 {
            return Err(Error::AuthorizationFailed(format!(
                "connector {} version {} does not use oauth2",
                connector_id, version
            )));
        }
        Ok(definition.require_oauth2()?.clone())
    }

    fn authorization_url(&self, definition: &OAuth2Definition, state_id: Uuid) -> Result<Url> {
        let redirect_uri = self.callback_url()?;
        let mut params: BTreeMap<&str, String> = BTreeMap::new();
        params.insert("access_type", "offline".to_string());
        for (key, value) in &definition.authorization_query_overrides {
            params.insert(key.as_str(), value.clone());
        }
        params.insert("redirect_uri", redirect_uri.to_string());
        params.insert("response_type", "code".to_string());
        params.insert("client_id", definition.client_id.clone());
        params.insert("scope", definition.scopes.join(" "));
        params.insert("state", state_id.to_string());

        let mut url = definition.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in &params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Flow operations bound to one connection.
#[derive(Clone)]
pub struct ConnectionFlow {
    flows: OAuth2Flows,
    context: TokenContext,
}

impl ConnectionFlow {
    pub fn connection_id(&self) -> Uuid {
        self.context.connection_id()
    }

    pub fn context(&self) -> &TokenContext {
        &self.context
    }

    /// Issues a new handshake state and returns the public redirect link.
    #[instrument(skip_all, fields(connection_id = %self.connection_id()))]
    pub async fn set_state_and_generate_public_url(
        &self,
        actor_id: Uuid,
        return_to_url: Option<Url>,
    ) -> Result<Url> {
        let inner = &self.flows.inner;
        let round_trip = chrono::Duration::from_std(inner.round_trip_timeout)
            .map_err(|e| Error::Validation(format!("round trip timeout out of range: {}", e)))?;

        let state = OAuth2State {
            id: Uuid::new_v4(),
            actor_id,
            connector_id: self.context.connection.connector_id,
            connector_version: self.context.connection.connector_version,
            connection_id: self.connection_id(),
            return_to_url,
            cancel_session_after_auth: false,
            expires_at: Utc::now() + round_trip,
        };
        inner.states.save(&state).await?;

        let token = inner
            .signer
            .issue(TokenAudience::Redirect, actor_id, state.id)?;
        let mut url = self.flows.public_url(REDIRECT_PATH)?;
        url.query_pairs_mut().append_pair("token", &token);

        counter!("oauth2_state_issued_total").increment(1);
        info!(state_id = %state.id, "Issued oauth2 state");
        Ok(url)
    }

    pub fn supports_revoke_tokens(&self) -> bool {
        self.flows.inner.tokens.supports_revoke_tokens(&self.context)
    }

    pub async fn revoke_tokens(&self) -> Result<RevokeOutcome> {
        self.flows.inner.tokens.revoke_tokens(&self.context).await
    }

    /// Attaches the connection's current access token to `request`.
    pub async fn authorize_request(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder> {
        self.flows
            .inner
            .tokens
            .authorize_request(&self.context, request)
            .await
    }

    /// Revokes what the provider allows, drops local tokens and leaves the
    /// connection `disconnected`.
    #[instrument(skip_all, fields(connection_id = %self.connection_id()))]
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.flows.inner;
        let connection_id = self.connection_id();

        inner
            .connections
            .set_state(connection_id, ConnectionState::Disconnecting)
            .await?;

        match inner.tokens.revoke_tokens(&self.context).await {
            Ok(RevokeOutcome::Unsupported) => {
                info!("Connector does not support revocation; dropping tokens locally");
            }
            Ok(RevokeOutcome::Revoked { .. }) => {}
            Err(err) => {
                warn!(error = %err, "Token revocation failed; dropping tokens locally");
            }
        }

        inner.tokens.delete_tokens(connection_id).await?;
        inner
            .connections
            .set_state(connection_id, ConnectionState::Disconnected)
            .await?;

        info!("Connection disconnected");
        Ok(())
    }
}
