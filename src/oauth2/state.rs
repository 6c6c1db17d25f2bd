//! OAuth2 handshake state
//!
//! One record per authorization attempt, held in the ephemeral store under a
//! UUID key and deleted on successful consumption.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::ephemeral::KeyValueStore;
use crate::error::{Error, Result};

const KEY_PREFIX: &str = "oauth2-state:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2State {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub connector_id: Uuid,
    pub connector_version: i64,
    pub connection_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_to_url: Option<Url>,
    #[serde(default)]
    pub cancel_session_after_auth: bool,
    pub expires_at: DateTime<Utc>,
}

impl OAuth2State {
    /// A record is only usable when every identity is set and it carries an expiry.
    pub fn is_valid(&self) -> bool {
        !self.id.is_nil()
            && !self.actor_id.is_nil()
            && !self.connector_id.is_nil()
            && self.connector_version > 0
            && !self.connection_id.is_nil()
            && self.expires_at.timestamp() > 0
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Time left before the record expires, zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Reads and writes [`OAuth2State`] records.
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn KeyValueStore>,
}

impl StateStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(id: Uuid) -> String {
        format!("{}{}", KEY_PREFIX, id)
    }

    /// Stores `state` with a TTL matching its own expiry.
    pub async fn save(&self, state: &OAuth2State) -> Result<()> {
        if !state.is_valid() {
            return Err(Error::Validation("oauth2 state is incomplete".into()));
        }
        let ttl = state.remaining_ttl();
        if ttl.is_zero() {
            return Err(Error::Validation("oauth2 state is already expired".into()));
        }
        let bytes = serde_json::to_vec(state)
            .map_err(|e| Error::Ephemeral(format!("failed to encode oauth2 state: {}", e)))?;
        self.store.set(&Self::key(state.id), bytes, ttl).await
    }

    pub async fn get(&self, id: Uuid) -> Result<OAuth2State> {
        let bytes = self
            .store
            .get(&Self::key(id))
            .await?
            .ok_or_else(|| Error::not_found("oauth2 state", id))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Ephemeral(format!("corrupt oauth2 state {}: {}", id, e)))
    }

    /// Deletes the record. Exactly one concurrent caller succeeds; the others
    /// get not-found.
    pub async fn consume(&self, id: Uuid) -> Result<()> {
        if self.store.delete(&Self::key(id)).await? {
            Ok(())
        } else {
            Err(Error::not_found("oauth2 state", id))
        }
    }

    /// Sets the cancel-on-auth flag, keeping the record's remaining lifetime.
    ///
    /// The write only lands if the record is unchanged since it was read, so
    /// a state consumed in the meantime stays consumed.
    pub async fn record_cancel_session_after_auth(
        &self,
        id: Uuid,
        actor_id: Uuid,
    ) -> Result<OAuth2State> {
        let key = Self::key(id);
        let current = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| Error::not_found("oauth2 state", id))?;
        let mut state: OAuth2State = serde_json::from_slice(&current)
            .map_err(|e| Error::Ephemeral(format!("corrupt oauth2 state {}: {}", id, e)))?;
        if state.actor_id != actor_id {
            return Err(Error::Validation(format!(
                "actor does not own oauth2 state {}",
                id
            )));
        }
        let ttl = state.remaining_ttl();
        if ttl.is_zero() {
            return Err(Error::not_found("oauth2 state", id));
        }

        state.cancel_session_after_auth = true;
        let updated = serde_json::to_vec(&state)
            .map_err(|e| Error::Ephemeral(format!("failed to encode oauth2 state: {}", e)))?;
        if !self
            .store
            .replace_if_equals(&key, &current, updated, ttl)
            .await?
        {
            return Err(Error::not_found("oauth2 state", id));
        }
        Ok(state)
    }
}
