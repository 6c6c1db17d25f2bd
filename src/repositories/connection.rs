//! Connection repository for database operations
//!
//! This module provides the ConnectionRepository struct which encapsulates
//! SeaORM operations for the connections table. State changes are single-row,
//! timestamped updates whose affected-row count is checked.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::connection::{self, ConnectionState, Entity as Connection};
use crate::models::connector_version::{self, Entity as ConnectorVersion};
use crate::validation::{validate_labels, validate_namespace};

/// Input for [`ConnectionRepository::create`].
#[derive(Debug, Clone, Default)]
pub struct NewConnection {
    pub namespace: String,
    pub connector_id: Uuid,
    pub connector_version: i64,
    pub labels: BTreeMap<String, String>,
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Creates a connection in `created` state pinned to an existing,
    /// non-deleted connector version.
    pub async fn create(&self, input: NewConnection) -> Result<connection::Model> {
        validate_namespace(&input.namespace)?;
        validate_labels(&input.labels)?;

        let labels = serde_json::to_value(&input.labels)
            .map_err(|e| Error::Validation(format!("labels are not serializable: {}", e)))?;

        let txn = self.db.begin().await?;

        let version = ConnectorVersion::find_by_id((input.connector_id, input.connector_version))
            .filter(connector_version::Column::DeletedAt.is_null())
            .one(&txn)
            .await?;
        if version.is_none() {
            return Err(Error::Validation(format!(
                "connector {} has no version {}",
                input.connector_id, input.connector_version
            )));
        }

        let id = Uuid::new_v4();
        let now = Utc::now().fixed_offset();
        Connection::insert(connection::ActiveModel {
            id: Set(id),
            namespace: Set(input.namespace),
            connector_id: Set(input.connector_id),
            connector_version: Set(input.connector_version),
            state: Set(ConnectionState::Created),
            labels: Set(labels),
            created_at: Set(now),
            updated_at: Set(now),
            deleted_at: Set(None),
        })
        .exec_without_returning(&txn)
        .await?;

        let created = Connection::find_by_id(id).one(&txn).await?.ok_or_else(|| {
            Error::Violation(format!("connection {} missing right after insert", id))
        })?;
        txn.commit().await?;

        tracing::info!(
            connection_id = %created.id,
            connector_id = %created.connector_id,
            version = created.connector_version,
            "Connection created"
        );
        Ok(created)
    }

    /// Gets a live connection by id
    pub async fn get(&self, id: Uuid) -> Result<connection::Model> {
        Connection::find_by_id(id)
            .filter(connection::Column::DeletedAt.is_null())
            .one(&*self.db)
            .await?
            .ok_or_else(|| Error::not_found("connection", id))
    }

    /// Moves a connection to `new_state`.
    ///
    /// Transitions are advisory except that a connection in `disconnecting` or
    /// `disconnected` can only stay where it is or move to `disconnected`.
    pub async fn set_state(&self, id: Uuid, new_state: ConnectionState) -> Result<connection::Model> {
        let txn = self.db.begin().await?;

        let current = Connection::find_by_id(id)
            .filter(connection::Column::DeletedAt.is_null())
            .one(&txn)
            .await?
            .ok_or_else(|| Error::not_found("connection", id))?;

        if current.state.is_terminal_phase()
            && new_state != ConnectionState::Disconnected
            && new_state != current.state
        {
            return Err(Error::Validation(format!(
                "connection {} is {} and cannot move to {}",
                id, current.state, new_state
            )));
        }

        let result = Connection::update_many()
            .col_expr(connection::Column::State, Expr::value(new_state))
            .col_expr(
                connection::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(connection::Column::Id.eq(id))
            .filter(connection::Column::DeletedAt.is_null())
            .exec(&txn)
            .await?;

        match result.rows_affected {
            0 => return Err(Error::not_found("connection", id)),
            1 => {}
            n => {
                return Err(Error::Violation(format!(
                    "state update for connection {} affected {} rows",
                    id, n
                )));
            }
        }

        let updated = Connection::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| Error::not_found("connection", id))?;
        txn.commit().await?;

        tracing::info!(
            connection_id = %id,
            from = %current.state,
            to = %new_state,
            "Connection state changed"
        );
        Ok(updated)
    }

    /// Soft delete. Missing and already-deleted connections are a no-op.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = Connection::update_many()
            .col_expr(
                connection::Column::DeletedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(connection::Column::Id.eq(id))
            .filter(connection::Column::DeletedAt.is_null())
            .exec(&*self.db)
            .await?;

        if result.rows_affected > 1 {
            return Err(Error::Violation(format!(
                "deleting connection {} affected {} rows",
                id, result.rows_affected
            )));
        }
        if result.rows_affected == 1 {
            tracing::info!(connection_id = %id, "Connection deleted");
        }
        Ok(())
    }
}
