//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! persisted entities. Multi-statement mutations run inside one transaction.

pub mod connection;
pub mod connector_version;
pub mod oauth2_token;
pub mod used_nonce;

pub use connection::{ConnectionRepository, NewConnection};
pub use connector_version::{ConnectorVersionInput, ConnectorVersionRepository};
pub use oauth2_token::{NewOAuth2Token, OAuth2TokenRepository, TokenWithConnection};
pub use used_nonce::UsedNonceRepository;
