//! Short-lived signed tokens carried by the user's browser.
//!
//! The public redirect URL embeds a token naming the actor and the handshake
//! state, and the callback cookie carries a second one. Both are HS256 JWTs
//! signed with a key derived from the master crypto key. Every token has a
//! nonce that is burned on first verification.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::CryptoKey;
use crate::error::{Error, Result};
use crate::repositories::UsedNonceRepository;

const SIGNING_KEY_LABEL: &[u8] = b"redirect-token-signing";
const LEEWAY_SECONDS: u64 = 5;

/// Which leg of the round trip a token is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAudience {
    /// Presented to `/oauth2/redirect`
    Redirect,
    /// Stored in the callback cookie
    Callback,
}

impl TokenAudience {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenAudience::Redirect => "oauth2-redirect",
            TokenAudience::Callback => "oauth2-callback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectClaims {
    /// Actor id
    pub sub: Uuid,
    /// OAuth2 state id
    pub sid: Uuid,
    /// Nonce
    pub jti: Uuid,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct RedirectTokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    redirect_ttl: Duration,
    callback_ttl: Duration,
    nonces: UsedNonceRepository,
}

impl RedirectTokenSigner {
    /// `redirect_ttl` bounds the public redirect link; `callback_ttl` bounds the
    /// cookie, which must outlive the user's visit to the provider.
    pub fn new(
        master: &CryptoKey,
        redirect_ttl: Duration,
        callback_ttl: Duration,
        nonces: UsedNonceRepository,
    ) -> Result<Self> {
        let key = master.derive(SIGNING_KEY_LABEL)?;
        Ok(Self {
            encoding: EncodingKey::from_secret(key.as_bytes()),
            decoding: DecodingKey::from_secret(key.as_bytes()),
            redirect_ttl,
            callback_ttl,
            nonces,
        })
    }

    pub fn ttl(&self, audience: TokenAudience) -> Duration {
        match audience {
            TokenAudience::Redirect => self.redirect_ttl,
            TokenAudience::Callback => self.callback_ttl,
        }
    }

    pub fn issue(&self, audience: TokenAudience, actor_id: Uuid, state_id: Uuid) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = RedirectClaims {
            sub: actor_id,
            sid: state_id,
            jti: Uuid::new_v4(),
            aud: audience.as_str().to_string(),
            iat: now,
            exp: now + self.ttl(audience).as_secs() as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Validation(format!("failed to sign redirect token: {}", e)))
    }

    /// Checks signature, audience and expiry, then burns the nonce. A second
    /// verification of the same token fails.
    pub async fn verify(&self, audience: TokenAudience, token: &str) -> Result<RedirectClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience.as_str()]);
        validation.leeway = LEEWAY_SECONDS;

        let claims = decode::<RedirectClaims>(token, &self.decoding, &validation)
            .map_err(|e| Error::Validation(format!("invalid {} token: {}", audience.as_str(), e)))?
            .claims;

        let retain_until = chrono::DateTime::from_timestamp(claims.exp, 0)
            .unwrap_or_else(Utc::now)
            + chrono::Duration::seconds(LEEWAY_SECONDS as i64);
        if !self.nonces.use_nonce(claims.jti, retain_until).await? {
            return Err(Error::Validation(format!(
                "{} token has already been used",
                audience.as_str()
            )));
        }

        Ok(claims)
    }
}
