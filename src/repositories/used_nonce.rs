//! Replay protection for redirect tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use crate::error::{Result, is_unique_violation};
use crate::models::used_nonce::{self, Entity as UsedNonce};

#[derive(Debug, Clone)]
pub struct UsedNonceRepository {
    pub db: Arc<DatabaseConnection>,
}

impl UsedNonceRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Records `nonce` as spent. Returns `false` when it had already been used.
    pub async fn use_nonce(&self, nonce: Uuid, retain_until: DateTime<Utc>) -> Result<bool> {
        let inserted = UsedNonce::insert(used_nonce::ActiveModel {
            id: Set(nonce),
            retain_until: Set(retain_until.fixed_offset()),
            created_at: Set(Utc::now().fixed_offset()),
        })
        .exec_without_returning(&*self.db)
        .await;

        match inserted {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => {
                tracing::warn!(nonce = %nonce, "Redirect token nonce replayed");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Removes nonces whose tokens can no longer verify anyway.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = UsedNonce::delete_many()
            .filter(used_nonce::Column::RetainUntil.lt(Utc::now().fixed_offset()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
