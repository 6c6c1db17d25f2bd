//! Connector definitions and the types describing how a connector authenticates.

pub mod definition;

pub use definition::{
    AuthDefinition, AuthType, ConnectorDefinition, OAuth2Definition, RefreshSettings,
};
