//! Connector definitions
//!
//! A definition is the decrypted content of one connector version: how to
//! authenticate against the third party and how its tokens should be kept
//! fresh.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, Result};

/// Query parameters the authorization flow always controls itself.
const RESERVED_AUTHORIZE_PARAMS: &[&str] = &[
    "client_id",
    "redirect_uri",
    "response_type",
    "scope",
    "state",
];

/// Authentication type supported by a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[serde(rename = "oauth2")]
    OAuth2,
    ApiKey,
    NoAuth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorDefinition {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub auth: AuthDefinition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthDefinition {
    #[serde(rename = "oauth2")]
    OAuth2(OAuth2Definition),
    ApiKey { header_name: String },
    NoAuth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Definition {
    pub client_id: String,
    pub client_secret: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<Url>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Static extra query parameters for the authorization redirect, e.g. `prompt=consent`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub authorization_query_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub refresh: RefreshSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSettings {
    /// Opt into the background refresh sweep
    #[serde(default)]
    pub in_background: bool,
    /// Overrides the global refresh-before-expiry window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_expiry_seconds: Option<u64>,
    /// Lock duration and retry budget for one refresh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl RefreshSettings {
    pub fn before_expiry(&self, global_default: Duration) -> Duration {
        self.before_expiry_seconds
            .map(Duration::from_secs)
            .unwrap_or(global_default)
    }

    pub fn timeout(&self, global_default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(global_default)
    }
}

impl ConnectorDefinition {
    pub fn auth_type(&self) -> AuthType {
        match self.auth {
            AuthDefinition::OAuth2(_) => AuthType::OAuth2,
            AuthDefinition::ApiKey { .. } => AuthType::ApiKey,
            AuthDefinition::NoAuth => AuthType::NoAuth,
        }
    }

    pub fn oauth2(&self) -> Option<&OAuth2Definition> {
        match &self.auth {
            AuthDefinition::OAuth2(oauth2) => Some(oauth2),
            _ => None,
        }
    }

    /// Like [`Self::oauth2`] but fails for non-OAuth2 connectors.
    pub fn require_oauth2(&self) -> Result<&OAuth2Definition> {
        self.oauth2().ok_or_else(|| {
            Error::Validation(format!(
                "connector '{}' does not use OAuth2",
                self.display_name
            ))
        })
    }

    /// SHA-256 over the canonical JSON encoding. Field order is fixed by the
    /// struct layout and maps are ordered, so equal definitions hash equally.
    pub fn content_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| Error::Validation(format!("definition is not serializable: {}", e)))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Validation(format!("definition is not serializable: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Violation(format!("stored definition is unreadable: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.display_name.trim().is_empty() {
            return Err(Error::Validation("display_name is required".into()));
        }

        match &self.auth {
            AuthDefinition::OAuth2(oauth2) => oauth2.validate(),
            AuthDefinition::ApiKey { header_name } if header_name.trim().is_empty() => Err(
                Error::Validation("api_key auth requires header_name".into()),
            ),
            _ => Ok(()),
        }
    }
}

impl OAuth2Definition {
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Validation("oauth2 client_id is required".into()));
        }
        if self.client_secret.is_empty() {
            return Err(Error::Validation("oauth2 client_secret is required".into()));
        }

        validate_endpoint("authorization_endpoint", &self.authorization_endpoint)?;
        validate_endpoint("token_endpoint", &self.token_endpoint)?;
        if let Some(revocation) = &self.revocation_endpoint {
            validate_endpoint("revocation_endpoint", revocation)?;
        }

        if let Some(reserved) = self
            .authorization_query_overrides
            .keys()
            .find(|key| RESERVED_AUTHORIZE_PARAMS.contains(&key.as_str()))
        {
            return Err(Error::Validation(format!(
                "authorization query override '{}' is reserved",
                reserved
            )));
        }

        Ok(())
    }

    pub fn supports_revocation(&self) -> bool {
        self.revocation_endpoint.is_some()
    }
}

/// Endpoints must be https without a fragment; plain http is tolerated for
/// loopback hosts only.
fn validate_endpoint(name: &str, url: &Url) -> Result<()> {
    let loopback = matches!(
        url.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("[::1]")
    );

    if url.scheme() != "https" && !(url.scheme() == "http" && loopback) {
        return Err(Error::Validation(format!("{} must use https", name)));
    }
    if url.fragment().is_some() {
        return Err(Error::Validation(format!(
            "{} must not contain a fragment",
            name
        )));
    }
    Ok(())
}
