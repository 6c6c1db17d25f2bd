//! # authproxy Library
//!
//! Connection and OAuth2 token lifecycle engine for an authorization proxy:
//! versioned connector definitions, connections, the authorization code flow,
//! serialized token refresh and the background refresh sweep.

pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod ephemeral;
pub mod error;
pub mod handlers;
pub mod models;
pub mod oauth2;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod tasks;
pub mod telemetry;
pub mod token_refresh;
pub mod validation;
pub use migration;
