//! # OAuth2
//!
//! Handshake state, redirect tokens, provider calls, the authorization flow and
//! token lifecycle management.

pub mod flow;
pub mod provider;
pub mod redirect_token;
pub mod state;
pub mod tokens;

pub use flow::{
    CALLBACK_PATH, CallbackOutcome, CallbackParams, ConnectionFlow, OAuth2Flows, REDIRECT_PATH,
    RedirectOutcome,
};
pub use provider::{ProviderClient, TokenResponse};
pub use redirect_token::{RedirectClaims, RedirectTokenSigner, TokenAudience};
pub use state::{OAuth2State, StateStore};
pub use tokens::{
    RefreshDefaults, RevokeOutcome, TokenContext, TokenManager, provider_call_budget,
    refresh_lock_name,
};
