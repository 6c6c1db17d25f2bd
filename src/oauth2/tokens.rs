//! # Token Manager
//!
//! Persists provider tokens, refreshes them under a per-connection distributed
//! lock, and revokes them. Token material only exists in plaintext for the
//! duration of a single call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::provider::{ProviderClient, TokenResponse, TokenTypeHint};
use crate::connectors::OAuth2Definition;
use crate::crypto::EncryptService;
use crate::ephemeral::{MutexFactory, MutexOptions};
use crate::error::{Error, ProviderStep, Result};
use crate::models::{connection, connector_version, oauth2_token};
use crate::repositories::{
    ConnectionRepository, ConnectorVersionRepository, NewOAuth2Token, OAuth2TokenRepository,
};

/// Name of the lock serializing refreshes of one connection's token.
pub fn refresh_lock_name(connection_id: Uuid) -> String {
    format!("oauth2-token-{}", connection_id)
}

/// Time left for the provider call once the lock is held. The margin leaves
/// room to persist the new token before the lease runs out.
pub fn provider_call_budget(lock_duration: Duration) -> Duration {
    let margin = (lock_duration / 5).min(Duration::from_secs(1));
    lock_duration.saturating_sub(margin)
}

/// Fallbacks used when a connector does not override its refresh settings.
#[derive(Debug, Clone, Copy)]
pub struct RefreshDefaults {
    pub before_expiry: Duration,
    pub timeout: Duration,
}

/// A connection together with the OAuth2 definition of its pinned version.
#[derive(Debug, Clone)]
pub struct TokenContext {
    pub connection: connection::Model,
    pub version: connector_version::Model,
    pub definition: OAuth2Definition,
}

impl TokenContext {
    pub fn connection_id(&self) -> Uuid {
        self.connection.id
    }
}

/// Outcome of [`TokenManager::revoke_tokens`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked { tokens_revoked: usize },
    /// The connector declares no revocation endpoint
    Unsupported,
}

#[derive(Clone)]
pub struct TokenManager {
    tokens: OAuth2TokenRepository,
    connections: ConnectionRepository,
    versions: ConnectorVersionRepository,
    encryptor: Arc<dyn EncryptService>,
    provider: ProviderClient,
    mutexes: MutexFactory,
    defaults: RefreshDefaults,
}

impl TokenManager {
    pub fn new(
        tokens: OAuth2TokenRepository,
        connections: ConnectionRepository,
        versions: ConnectorVersionRepository,
        encryptor: Arc<dyn EncryptService>,
        provider: ProviderClient,
        mutexes: MutexFactory,
        defaults: RefreshDefaults,
    ) -> Self {
        Self {
            tokens,
            connections,
            versions,
            encryptor,
            provider,
            mutexes,
            defaults,
        }
    }

    pub fn defaults(&self) -> RefreshDefaults {
        self.defaults
    }

    /// Loads a live connection and the OAuth2 definition it is pinned to.
    pub async fn load_context(&self, connection_id: Uuid) -> Result<TokenContext> {
        let connection = self.connections.get(connection_id).await?;
        let version = self
            .versions
            .get(connection.connector_id, connection.connector_version)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    "connector version",
                    format!("{}@{}", connection.connector_id, connection.connector_version),
                )
            })?;
        let definition = self
            .versions
            .load_definition(&version)?
            .require_oauth2()?
            .clone();

        Ok(TokenContext {
            connection,
            version,
            definition,
        })
    }

    /// Refresh window for this connector, global default when not overridden.
    pub fn refresh_window(&self, definition: &OAuth2Definition) -> Duration {
        definition.refresh.before_expiry(self.defaults.before_expiry)
    }

    fn lock_options(&self, definition: &OAuth2Definition) -> MutexOptions {
        MutexOptions::with_timeout(definition.refresh.timeout(self.defaults.timeout))
    }

    pub async fn get_token(&self, connection_id: Uuid) -> Result<oauth2_token::Model> {
        self.tokens.get(connection_id).await
    }

    pub fn decrypt_access_token(&self, token: &oauth2_token::Model) -> Result<String> {
        Ok(self
            .encryptor
            .decrypt_string_for_connection(token.connection_id, &token.encrypted_access_token)?)
    }

    pub fn decrypt_refresh_token(&self, token: &oauth2_token::Model) -> Result<Option<String>> {
        token
            .encrypted_refresh_token
            .as_ref()
            .map(|ciphertext| {
                self.encryptor
                    .decrypt_string_for_connection(token.connection_id, ciphertext)
                    .map_err(Error::from)
            })
            .transpose()
    }

    /// Encrypts and stores the token carried by a provider response.
    ///
    /// When `refresh_from` is set the new row is chained to it, and its refresh
    /// token ciphertext is carried forward if the provider did not rotate it.
    /// Scopes fall back to `requested_scopes` when the response omits them.
    pub async fn create_db_token_from_response(
        &self,
        connection_id: Uuid,
        response: &TokenResponse,
        requested_scopes: &[String],
        refresh_from: Option<&oauth2_token::Model>,
    ) -> Result<oauth2_token::Model> {
        let step = if refresh_from.is_some() {
            ProviderStep::Refresh
        } else {
            ProviderStep::Exchange
        };

        let access_token = response
            .access_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::provider(step, None, "token response has no access_token"))?;

        let encrypted_access_token = self
            .encryptor
            .encrypt_for_connection(connection_id, access_token.as_bytes())?;

        let encrypted_refresh_token = match response
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
        {
            Some(refresh_token) => Some(
                self.encryptor
                    .encrypt_for_connection(connection_id, refresh_token.as_bytes())?,
            ),
            None => refresh_from.and_then(|previous| previous.encrypted_refresh_token.clone()),
        };

        let access_token_expires_at = match &response.expires_in {
            Some(expires_in) => match expires_in.seconds() {
                Some(seconds) => Some(Utc::now() + chrono::Duration::seconds(seconds.max(0))),
                None => {
                    warn!(connection_id = %connection_id, "Ignoring unparsable expires_in");
                    None
                }
            },
            None => None,
        };

        let scopes = response
            .granted_scopes()
            .unwrap_or_else(|| requested_scopes.to_vec());

        self.tokens
            .insert(NewOAuth2Token {
                connection_id,
                refreshed_from_id: refresh_from.map(|previous| previous.id),
                encrypted_access_token,
                encrypted_refresh_token,
                access_token_expires_at,
                scopes,
            })
            .await
    }

    /// Refreshes unconditionally unless another caller already replaced the
    /// token while this one waited for the lock.
    pub async fn refresh(&self, ctx: &TokenContext) -> Result<oauth2_token::Model> {
        let observed = self.tokens.get(ctx.connection_id()).await?.id;
        self.refresh_under_lock(ctx, |current| current.id == observed)
            .await
    }

    /// Refreshes only if, once the lock is held, the live token still expires
    /// within `window`.
    pub async fn refresh_if_expiring(
        &self,
        ctx: &TokenContext,
        window: Duration,
    ) -> Result<oauth2_token::Model> {
        let window = to_chrono(window);
        self.refresh_under_lock(ctx, |current| current.expires_within(window))
            .await
    }

    #[instrument(skip_all, fields(connection_id = %ctx.connection_id()))]
    async fn refresh_under_lock<P>(
        &self,
        ctx: &TokenContext,
        still_needed: P,
    ) -> Result<oauth2_token::Model>
    where
        P: FnOnce(&oauth2_token::Model) -> bool,
    {
        let connection_id = ctx.connection_id();
        let options = self.lock_options(&ctx.definition);
        let budget = provider_call_budget(options.lock_duration);
        let mutex = self
            .mutexes
            .create(refresh_lock_name(connection_id), options);

        mutex
            .with_lock(|| async {
                let current = self.tokens.get(connection_id).await?;
                if !still_needed(&current) {
                    debug!("Token already refreshed by another caller");
                    counter!("oauth2_token_refresh_total", "outcome" => "skipped").increment(1);
                    return Ok(current);
                }

                let started = Instant::now();
                let result = self.refresh_with_provider(ctx, &current, budget).await;
                histogram!("oauth2_token_refresh_duration_seconds")
                    .record(started.elapsed().as_secs_f64());

                match &result {
                    Ok(token) => {
                        counter!("oauth2_token_refresh_total", "outcome" => "success").increment(1);
                        info!(
                            connector_id = %ctx.version.connector_id,
                            version = ctx.version.version,
                            token_id = %token.id,
                            "Refreshed OAuth2 token"
                        );
                    }
                    Err(err) => {
                        counter!("oauth2_token_refresh_total", "outcome" => "failure").increment(1);
                        warn!(
                            connector_id = %ctx.version.connector_id,
                            version = ctx.version.version,
                            step = %ProviderStep::Refresh,
                            error = %err,
                            "OAuth2 token refresh failed; keeping current token"
                        );
                    }
                }
                result
            })
            .await
    }

    async fn refresh_with_provider(
        &self,
        ctx: &TokenContext,
        current: &oauth2_token::Model,
        budget: Duration,
    ) -> Result<oauth2_token::Model> {
        let refresh_token = self.decrypt_refresh_token(current)?.ok_or_else(|| {
            Error::Validation(format!(
                "connection {} has no refresh token",
                current.connection_id
            ))
        })?;

        // The call must not outlive the lock lease.
        let response =
            tokio::time::timeout(budget, self.provider.refresh(&ctx.definition, &refresh_token))
                .await
                .map_err(|_| {
                    Error::provider(
                        ProviderStep::Refresh,
                        None,
                        format!("no response within {}ms", budget.as_millis()),
                    )
                })??;
        self.create_db_token_from_response(
            current.connection_id,
            &response,
            &current.scope_list(),
            Some(current),
        )
        .await
    }

    /// Returns a usable access token, refreshing first when it is expired or
    /// inside the connector's refresh window.
    pub async fn get_valid_access_token(&self, ctx: &TokenContext) -> Result<String> {
        let mut token = self.tokens.get(ctx.connection_id()).await?;
        let window = self.refresh_window(&ctx.definition);
        if token.expires_within(to_chrono(window)) {
            token = self.refresh_if_expiring(ctx, window).await?;
        }
        self.decrypt_access_token(&token)
    }

    /// Attaches `Authorization: Bearer <access token>` to an outbound request.
    pub async fn authorize_request(
        &self,
        ctx: &TokenContext,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder> {
        let access_token = self.get_valid_access_token(ctx).await?;
        Ok(request.bearer_auth(access_token))
    }

    pub fn supports_revoke_tokens(&self, ctx: &TokenContext) -> bool {
        ctx.definition.supports_revocation()
    }

    /// Revokes the refresh token, then the access token, at the provider and
    /// soft-deletes the local rows.
    #[instrument(skip_all, fields(connection_id = %ctx.connection_id()))]
    pub async fn revoke_tokens(&self, ctx: &TokenContext) -> Result<RevokeOutcome> {
        if !self.supports_revoke_tokens(ctx) {
            return Ok(RevokeOutcome::Unsupported);
        }

        let connection_id = ctx.connection_id();
        let mutex = self.mutexes.create(
            refresh_lock_name(connection_id),
            self.lock_options(&ctx.definition),
        );

        mutex
            .with_lock(|| async {
                let token = match self.tokens.get(connection_id).await {
                    Ok(token) => token,
                    Err(err) if err.is_not_found() => {
                        return Ok(RevokeOutcome::Revoked { tokens_revoked: 0 });
                    }
                    Err(err) => return Err(err),
                };

                let mut revoked = 0;
                if let Some(refresh_token) = self.decrypt_refresh_token(&token)? {
                    self.provider
                        .revoke(&ctx.definition, &refresh_token, TokenTypeHint::RefreshToken)
                        .await?;
                    revoked += 1;
                }
                let access_token = self.decrypt_access_token(&token)?;
                if !access_token.is_empty() {
                    self.provider
                        .revoke(&ctx.definition, &access_token, TokenTypeHint::AccessToken)
                        .await?;
                    revoked += 1;
                }

                self.tokens.delete_all_for_connection(connection_id).await?;
                info!(tokens_revoked = revoked, "Revoked OAuth2 tokens");
                Ok(RevokeOutcome::Revoked {
                    tokens_revoked: revoked,
                })
            })
            .await
    }

    /// Soft-deletes every live token of the connection without contacting the provider.
    pub async fn delete_tokens(&self, connection_id: Uuid) -> Result<u64> {
        self.tokens.delete_all_for_connection(connection_id).await
    }
}

/// Windows beyond chrono's range are clamped to a century.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::days(36_500))
        .min(chrono::Duration::days(36_500))
}
