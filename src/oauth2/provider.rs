//! Server-to-server calls against a third party's token and revocation
//! endpoints.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connectors::OAuth2Definition;
use crate::error::{Error, ProviderStep, Result};

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// `expires_in` arrives as a number from most providers and as a string from a few.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpiresIn {
    Seconds(i64),
    Text(String),
}

impl ExpiresIn {
    pub fn seconds(&self) -> Option<i64> {
        match self {
            ExpiresIn::Seconds(value) => Some(*value),
            ExpiresIn::Text(value) => value.trim().parse().ok(),
        }
    }
}

/// Token endpoint response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<ExpiresIn>,
    /// Space-delimited granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    pub fn from_slice(step: ProviderStep, body: &[u8]) -> Result<Self> {
        let response: TokenResponse = serde_json::from_slice(body)
            .map_err(|e| Error::provider(step, None, format!("malformed token response: {}", e)))?;
        if let Some(error) = &response.error {
            let detail = match &response.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error.clone(),
            };
            return Err(Error::provider(step, None, detail));
        }
        Ok(response)
    }

    pub fn granted_scopes(&self) -> Option<Vec<String>> {
        self.scope
            .as_deref()
            .map(|scope| scope.split_whitespace().map(str::to_string).collect())
    }
}

/// RFC 7009 `token_type_hint` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTypeHint {
    RefreshToken,
    AccessToken,
}

impl TokenTypeHint {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenTypeHint::RefreshToken => "refresh_token",
            TokenTypeHint::AccessToken => "access_token",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
}

impl Default for ProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// `grant_type=authorization_code`
    pub async fn exchange_code(
        &self,
        definition: &OAuth2Definition,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", definition.client_id.as_str()),
            ("client_secret", definition.client_secret.as_str()),
        ];
        self.token_request(ProviderStep::Exchange, definition, &params)
            .await
    }

    /// `grant_type=refresh_token`
    pub async fn refresh(
        &self,
        definition: &OAuth2Definition,
        refresh_token: &str,
    ) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", definition.client_id.as_str()),
            ("client_secret", definition.client_secret.as_str()),
        ];
        self.token_request(ProviderStep::Refresh, definition, &params)
            .await
    }

    /// Revokes one token. Fails with `Validation` when the connector has no
    /// revocation endpoint.
    pub async fn revoke(
        &self,
        definition: &OAuth2Definition,
        token: &str,
        hint: TokenTypeHint,
    ) -> Result<()> {
        let endpoint = definition
            .revocation_endpoint
            .as_ref()
            .ok_or_else(|| Error::Validation("connector has no revocation endpoint".into()))?;

        let params = [
            ("token", token),
            ("token_type_hint", hint.as_str()),
            ("client_id", definition.client_id.as_str()),
            ("client_secret", definition.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(endpoint.clone())
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::provider(ProviderStep::Revoke, None, e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(Error::provider(ProviderStep::Revoke, Some(status), body))
        }
    }

    async fn token_request(
        &self,
        step: ProviderStep,
        definition: &OAuth2Definition,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse> {
        let response = self
            .http
            .post(definition.token_endpoint.clone())
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| Error::provider(step, None, e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::provider(step, Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            return Err(Error::provider(
                step,
                Some(status.as_u16()),
                String::from_utf8_lossy(&body),
            ));
        }

        TokenResponse::from_slice(step, &body)
    }
}
