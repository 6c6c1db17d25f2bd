//! Test utilities shared by the integration tests.
//!
//! Provides an in-memory SQLite database with all migrations applied and a
//! fully wired engine whose provider endpoints point at a wiremock server.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use authproxy::connectors::{AuthDefinition, ConnectorDefinition, OAuth2Definition, RefreshSettings};
use authproxy::crypto::{AesGcmEncryptService, CryptoKey, EncryptService};
use authproxy::ephemeral::{MemoryKeyValueStore, MutexFactory};
use authproxy::models::connection::{self, ConnectionState};
use authproxy::models::connector_version::{self, ConnectorVersionState};
use authproxy::models::oauth2_token;
use authproxy::oauth2::{
    OAuth2Flows, ProviderClient, RedirectTokenSigner, RefreshDefaults, StateStore, TokenManager,
};
use authproxy::repositories::{
    ConnectionRepository, ConnectorVersionInput, ConnectorVersionRepository, NewConnection,
    NewOAuth2Token, OAuth2TokenRepository, UsedNonceRepository,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use url::Url;
use uuid::Uuid;

pub const PUBLIC_BASE_URL: &str = "http://localhost:8080";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Sets up an in-memory SQLite database with all migrations applied and returns an Arc.
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![42u8; 32]).expect("32 byte key")
}

pub fn test_encryptor() -> Arc<dyn EncryptService> {
    Arc::new(AesGcmEncryptService::new(test_crypto_key()))
}

/// OAuth2 connector definition whose endpoints live under `provider_uri`.
pub fn oauth2_definition(provider_uri: &str) -> ConnectorDefinition {
    ConnectorDefinition {
        display_name: "Test Provider".to_string(),
        description: None,
        auth: AuthDefinition::OAuth2(OAuth2Definition {
            client_id: "client-123".to_string(),
            client_secret: "secret-456".to_string(),
            authorization_endpoint: Url::parse(&format!("{}/authorize", provider_uri))
                .expect("authorization url"),
            token_endpoint: Url::parse(&format!("{}/token", provider_uri)).expect("token url"),
            revocation_endpoint: Some(
                Url::parse(&format!("{}/revoke", provider_uri)).expect("revocation url"),
            ),
            scopes: vec!["read".to_string(), "write".to_string()],
            authorization_query_overrides: BTreeMap::new(),
            refresh: RefreshSettings::default(),
        }),
    }
}

/// Same definition with background refresh switched on.
pub fn background_definition(provider_uri: &str, before_expiry_seconds: Option<u64>) -> ConnectorDefinition {
    let mut definition = oauth2_definition(provider_uri);
    if let AuthDefinition::OAuth2(oauth2) = &mut definition.auth {
        oauth2.refresh.in_background = true;
        oauth2.refresh.before_expiry_seconds = before_expiry_seconds;
    }
    definition
}

/// Everything an integration test needs, wired against one database.
pub struct TestEngine {
    pub db: Arc<DatabaseConnection>,
    pub encryptor: Arc<dyn EncryptService>,
    pub store: Arc<MemoryKeyValueStore>,
    pub versions: ConnectorVersionRepository,
    pub connections: ConnectionRepository,
    pub tokens: OAuth2TokenRepository,
    pub nonces: UsedNonceRepository,
    pub manager: TokenManager,
    pub flows: OAuth2Flows,
}

pub async fn build_test_engine() -> Result<TestEngine> {
    let db = setup_test_db_arc().await?;
    let encryptor = test_encryptor();
    let store = Arc::new(MemoryKeyValueStore::new());

    let versions = ConnectorVersionRepository::new(db.clone(), encryptor.clone());
    let connections = ConnectionRepository::new(db.clone());
    let tokens = OAuth2TokenRepository::new(db.clone());
    let nonces = UsedNonceRepository::new(db.clone());
    let provider = ProviderClient::new();

    let manager = TokenManager::new(
        tokens.clone(),
        connections.clone(),
        versions.clone(),
        encryptor.clone(),
        provider.clone(),
        MutexFactory::new(store.clone()),
        RefreshDefaults {
            before_expiry: Duration::from_secs(600),
            timeout: Duration::from_secs(10),
        },
    );

    let signer = RedirectTokenSigner::new(
        &test_crypto_key(),
        Duration::from_secs(300),
        Duration::from_secs(600),
        nonces.clone(),
    )?;

    let flows = OAuth2Flows::new(
        Url::parse(PUBLIC_BASE_URL)?,
        Duration::from_secs(600),
        versions.clone(),
        connections.clone(),
        StateStore::new(store.clone()),
        signer,
        manager.clone(),
        provider,
    );

    Ok(TestEngine {
        db,
        encryptor,
        store,
        versions,
        connections,
        tokens,
        nonces,
        manager,
        flows,
    })
}

impl TestEngine {
    /// Publishes `definition` as the next primary version of `connector_id`.
    pub async fn publish(
        &self,
        connector_id: Uuid,
        version: i64,
        definition: ConnectorDefinition,
    ) -> Result<connector_version::Model> {
        Ok(self
            .versions
            .upsert(ConnectorVersionInput {
                connector_id,
                version,
                namespace: "root.test".to_string(),
                connector_type: "test-provider".to_string(),
                state: ConnectorVersionState::Primary,
                definition,
            })
            .await?)
    }

    pub async fn create_connection(&self, version: &connector_version::Model) -> Result<connection::Model> {
        Ok(self
            .connections
            .create(NewConnection {
                namespace: "root.test".to_string(),
                connector_id: version.connector_id,
                connector_version: version.version,
                labels: BTreeMap::new(),
            })
            .await?)
    }

    /// Publishes a connector and creates a `ready` connection on it.
    pub async fn ready_connection(&self, definition: ConnectorDefinition) -> Result<connection::Model> {
        let version = self.publish(Uuid::new_v4(), 1, definition).await?;
        let connection = self.create_connection(&version).await?;
        Ok(self
            .connections
            .set_state(connection.id, ConnectionState::Ready)
            .await?)
    }

    /// Stores a live token whose access token expires `expires_in_seconds`
    /// from now (negative for already expired).
    pub async fn seed_token(
        &self,
        connection_id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_seconds: Option<i64>,
    ) -> Result<oauth2_token::Model> {
        let encrypted_refresh_token = match refresh_token {
            Some(token) => Some(
                self.encryptor
                    .encrypt_for_connection(connection_id, token.as_bytes())?,
            ),
            None => None,
        };

        Ok(self
            .tokens
            .insert(NewOAuth2Token {
                connection_id,
                refreshed_from_id: None,
                encrypted_access_token: self
                    .encryptor
                    .encrypt_for_connection(connection_id, access_token.as_bytes())?,
                encrypted_refresh_token,
                access_token_expires_at: expires_in_seconds
                    .map(|seconds| chrono::Utc::now() + chrono::Duration::seconds(seconds)),
                scopes: vec!["read".to_string()],
            })
            .await?)
    }
}
