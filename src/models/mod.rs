//! # Data Models
//!
//! SeaORM entities for everything the proxy persists.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod connection;
pub mod connector_version;
pub mod ephemeral_entry;
pub mod oauth2_token;
pub mod used_nonce;

pub use connection::Entity as Connection;
pub use connector_version::Entity as ConnectorVersion;
pub use ephemeral_entry::Entity as EphemeralEntry;
pub use oauth2_token::Entity as OAuth2Token;
pub use used_nonce::Entity as UsedNonce;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "authproxy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
