//! Ephemeral store backed by the `ephemeral_entries` table.
//!
//! Conditional writes rely on the primary key: `set_if_absent` first clears an
//! expired row for the key, then inserts with `ON CONFLICT DO NOTHING` and
//! inspects the affected-row count.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

use super::KeyValueStore;
use crate::error::{Error, Result};
use crate::models::ephemeral_entry::{self, Entity as EphemeralEntry};

#[derive(Debug, Clone)]
pub struct DatabaseKeyValueStore {
    db: Arc<DatabaseConnection>,
}

impl DatabaseKeyValueStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn expiry(ttl: Duration) -> Result<chrono::DateTime<chrono::FixedOffset>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Ephemeral(format!("ttl out of range: {}", e)))?;
        Ok((Utc::now() + ttl).fixed_offset())
    }

    fn row(key: &str, value: Vec<u8>, ttl: Duration) -> Result<ephemeral_entry::ActiveModel> {
        Ok(ephemeral_entry::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value),
            expires_at: Set(Self::expiry(ttl)?),
        })
    }
}

#[async_trait]
impl KeyValueStore for DatabaseKeyValueStore {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        EphemeralEntry::insert(Self::row(key, value, ttl)?)
            .on_conflict(
                OnConflict::column(ephemeral_entry::Column::Key)
                    .update_columns([
                        ephemeral_entry::Column::Value,
                        ephemeral_entry::Column::ExpiresAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(EphemeralEntry::find_by_id(key.to_string())
            .filter(ephemeral_entry::Column::ExpiresAt.gt(Utc::now().fixed_offset()))
            .one(&*self.db)
            .await?
            .map(|entry| entry.value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = EphemeralEntry::delete_many()
            .filter(ephemeral_entry::Column::Key.eq(key))
            .filter(ephemeral_entry::Column::ExpiresAt.gt(Utc::now().fixed_offset()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        EphemeralEntry::delete_many()
            .filter(ephemeral_entry::Column::Key.eq(key))
            .filter(ephemeral_entry::Column::ExpiresAt.lte(Utc::now().fixed_offset()))
            .exec(&*self.db)
            .await?;

        let inserted = EphemeralEntry::insert(Self::row(key, value, ttl)?)
            .on_conflict(
                OnConflict::column(ephemeral_entry::Column::Key)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(inserted == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let result = EphemeralEntry::delete_many()
            .filter(ephemeral_entry::Column::Key.eq(key))
            .filter(ephemeral_entry::Column::Value.eq(expected.to_vec()))
            .filter(ephemeral_entry::Column::ExpiresAt.gt(Utc::now().fixed_offset()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn replace_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        let result = EphemeralEntry::update_many()
            .col_expr(ephemeral_entry::Column::Value, Expr::value(value))
            .col_expr(ephemeral_entry::Column::ExpiresAt, Expr::value(Self::expiry(ttl)?))
            .filter(ephemeral_entry::Column::Key.eq(key))
            .filter(ephemeral_entry::Column::Value.eq(expected.to_vec()))
            .filter(ephemeral_entry::Column::ExpiresAt.gt(Utc::now().fixed_offset()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = EphemeralEntry::delete_many()
            .filter(ephemeral_entry::Column::ExpiresAt.lte(Utc::now().fixed_offset()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
