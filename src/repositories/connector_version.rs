//! Connector version registry
//!
//! Owns the draft/primary/active/archived state machine. Every mutation runs in
//! one transaction so sequencing, single-primary and draft-only-edit checks are
//! decided against the same snapshot that is written.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::connectors::ConnectorDefinition;
use crate::crypto::EncryptService;
use crate::error::{Error, Result};
use crate::models::connection;
use crate::models::connector_version::{self, ConnectorVersionState, Entity as ConnectorVersion};
use crate::validation::validate_namespace;

/// Input for [`ConnectorVersionRepository::upsert`].
#[derive(Debug, Clone)]
pub struct ConnectorVersionInput {
    pub connector_id: Uuid,
    pub version: i64,
    pub namespace: String,
    pub connector_type: String,
    pub state: ConnectorVersionState,
    pub definition: ConnectorDefinition,
}

#[derive(Clone)]
pub struct ConnectorVersionRepository {
    db: Arc<DatabaseConnection>,
    encryptor: Arc<dyn EncryptService>,
}

impl ConnectorVersionRepository {
    pub fn new(db: Arc<DatabaseConnection>, encryptor: Arc<dyn EncryptService>) -> Self {
        Self { db, encryptor }
    }

    /// Inserts the next version of a connector or re-saves an existing draft.
    ///
    /// New rows must be exactly `max(version) + 1` and start as `draft` or
    /// `primary`. Existing rows must still be `draft`; only their state and
    /// definition may change.
    pub async fn upsert(&self, input: ConnectorVersionInput) -> Result<connector_version::Model> {
        if input.version < 1 {
            return Err(Error::Validation(format!(
                "version must be >= 1, got {}",
                input.version
            )));
        }
        validate_namespace(&input.namespace)?;
        if input.connector_type.trim().is_empty() {
            return Err(Error::Validation("connector type is required".into()));
        }
        input.definition.validate()?;

        let hash = input.definition.content_hash()?;
        let encrypted_definition = self.encryptor.encrypt_for_connector_version(
            input.connector_id,
            input.version,
            &input.definition.to_bytes()?,
        )?;

        let txn = self.db.begin().await?;
        let now = Utc::now().fixed_offset();

        let existing = ConnectorVersion::find_by_id((input.connector_id, input.version))
            .one(&txn)
            .await?;

        match existing {
            None => {
                if !matches!(
                    input.state,
                    ConnectorVersionState::Draft | ConnectorVersionState::Primary
                ) {
                    return Err(Error::Validation(format!(
                        "new connector versions must be draft or primary, not {}",
                        input.state
                    )));
                }

                let expected = Self::max_version(&txn, input.connector_id).await? + 1;
                if input.version != expected {
                    return Err(Error::Validation(format!(
                        "connector {} expects version {}, got {}",
                        input.connector_id, expected, input.version
                    )));
                }

                Self::apply_state_side_effects(
                    &txn,
                    input.connector_id,
                    input.version,
                    input.state,
                )
                .await?;

                ConnectorVersion::insert(connector_version::ActiveModel {
                    connector_id: Set(input.connector_id),
                    version: Set(input.version),
                    namespace: Set(input.namespace.clone()),
                    state: Set(input.state),
                    connector_type: Set(input.connector_type.clone()),
                    hash: Set(hash),
                    encrypted_definition: Set(encrypted_definition),
                    created_at: Set(now),
                    updated_at: Set(now),
                    deleted_at: Set(None),
                })
                .exec_without_returning(&txn)
                .await?;
            }
            Some(row) => {
                if row.deleted_at.is_some() {
                    return Err(Error::Validation(format!(
                        "connector {} version {} was deleted",
                        row.connector_id, row.version
                    )));
                }
                if row.state != ConnectorVersionState::Draft {
                    return Err(Error::Validation(format!(
                        "connector {} version {} is {} and can no longer be modified",
                        row.connector_id, row.version, row.state
                    )));
                }
                if row.namespace != input.namespace || row.connector_type != input.connector_type
                {
                    return Err(Error::Validation(
                        "namespace and type of a connector version are immutable".into(),
                    ));
                }
                if !matches!(
                    input.state,
                    ConnectorVersionState::Draft | ConnectorVersionState::Primary
                ) {
                    return Err(Error::Validation(format!(
                        "a draft may only be re-saved or promoted to primary, not moved to {}",
                        input.state
                    )));
                }

                Self::apply_state_side_effects(
                    &txn,
                    input.connector_id,
                    input.version,
                    input.state,
                )
                .await?;

                let result = ConnectorVersion::update_many()
                    .col_expr(connector_version::Column::State, Expr::value(input.state))
                    .col_expr(connector_version::Column::Hash, Expr::value(hash))
                    .col_expr(
                        connector_version::Column::EncryptedDefinition,
                        Expr::value(encrypted_definition),
                    )
                    .col_expr(connector_version::Column::UpdatedAt, Expr::value(now))
                    .filter(connector_version::Column::ConnectorId.eq(input.connector_id))
                    .filter(connector_version::Column::Version.eq(input.version))
                    .filter(connector_version::Column::State.eq(ConnectorVersionState::Draft))
                    .filter(connector_version::Column::DeletedAt.is_null())
                    .exec(&txn)
                    .await?;
                Self::expect_single_row(result.rows_affected, input.connector_id, input.version)?;
            }
        }

        let saved = Self::fetch_in(&txn, input.connector_id, input.version).await?;
        txn.commit().await?;

        tracing::info!(
            connector_id = %saved.connector_id,
            version = saved.version,
            state = %saved.state,
            "Connector version saved"
        );
        Ok(saved)
    }

    /// Forces a state transition, demoting the previous primary or archiving the
    /// previous draft as needed.
    pub async fn set_state(
        &self,
        connector_id: Uuid,
        version: i64,
        new_state: ConnectorVersionState,
    ) -> Result<connector_version::Model> {
        let txn = self.db.begin().await?;

        Self::apply_state_side_effects(&txn, connector_id, version, new_state).await?;

        let result = ConnectorVersion::update_many()
            .col_expr(connector_version::Column::State, Expr::value(new_state))
            .col_expr(
                connector_version::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(connector_version::Column::ConnectorId.eq(connector_id))
            .filter(connector_version::Column::Version.eq(version))
            .filter(connector_version::Column::DeletedAt.is_null())
            .exec(&txn)
            .await?;
        Self::expect_single_row(result.rows_affected, connector_id, version)?;

        let saved = Self::fetch_in(&txn, connector_id, version).await?;
        txn.commit().await?;

        tracing::info!(
            connector_id = %connector_id,
            version,
            state = %new_state,
            "Connector version state set"
        );
        Ok(saved)
    }

    pub async fn get(
        &self,
        connector_id: Uuid,
        version: i64,
    ) -> Result<Option<connector_version::Model>> {
        Ok(ConnectorVersion::find_by_id((connector_id, version))
            .filter(connector_version::Column::DeletedAt.is_null())
            .one(&*self.db)
            .await?)
    }

    /// Newest live version currently in `state`.
    pub async fn get_for_state(
        &self,
        connector_id: Uuid,
        state: ConnectorVersionState,
    ) -> Result<Option<connector_version::Model>> {
        Ok(Self::live(connector_id)
            .filter(connector_version::Column::State.eq(state))
            .order_by_desc(connector_version::Column::Version)
            .one(&*self.db)
            .await?)
    }

    /// Newest live version in any state.
    pub async fn get_newest(&self, connector_id: Uuid) -> Result<Option<connector_version::Model>> {
        Ok(Self::live(connector_id)
            .order_by_desc(connector_version::Column::Version)
            .one(&*self.db)
            .await?)
    }

    /// Newest live version that is `primary` or `active`.
    pub async fn get_newest_published(
        &self,
        connector_id: Uuid,
    ) -> Result<Option<connector_version::Model>> {
        Ok(Self::live(connector_id)
            .filter(connector_version::Column::State.is_in([
                ConnectorVersionState::Primary,
                ConnectorVersionState::Active,
            ]))
            .order_by_desc(connector_version::Column::Version)
            .one(&*self.db)
            .await?)
    }

    /// All live versions of a connector, newest first.
    pub async fn list_versions(&self, connector_id: Uuid) -> Result<Vec<connector_version::Model>> {
        Ok(Self::live(connector_id)
            .order_by_desc(connector_version::Column::Version)
            .all(&*self.db)
            .await?)
    }

    /// Every published version across all connectors.
    pub async fn list_published(&self) -> Result<Vec<connector_version::Model>> {
        Ok(ConnectorVersion::find()
            .filter(connector_version::Column::DeletedAt.is_null())
            .filter(connector_version::Column::State.is_in([
                ConnectorVersionState::Primary,
                ConnectorVersionState::Active,
            ]))
            .order_by_asc(connector_version::Column::ConnectorId)
            .order_by_desc(connector_version::Column::Version)
            .all(&*self.db)
            .await?)
    }

    /// Soft delete; deleting a missing or already-deleted version is a no-op.
    pub async fn delete(&self, connector_id: Uuid, version: i64) -> Result<()> {
        let result = ConnectorVersion::update_many()
            .col_expr(
                connector_version::Column::DeletedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(connector_version::Column::ConnectorId.eq(connector_id))
            .filter(connector_version::Column::Version.eq(version))
            .filter(connector_version::Column::DeletedAt.is_null())
            .exec(&*self.db)
            .await?;

        if result.rows_affected > 1 {
            return Err(Error::Violation(format!(
                "deleting connector {} version {} affected {} rows",
                connector_id, version, result.rows_affected
            )));
        }
        Ok(())
    }

    /// Archives `active` versions that no live connection still references.
    /// Returns the archived version numbers.
    pub async fn archive_unreferenced(&self, connector_id: Uuid) -> Result<Vec<i64>> {
        let txn = self.db.begin().await?;

        let candidates = ConnectorVersion::find()
            .filter(connector_version::Column::ConnectorId.eq(connector_id))
            .filter(connector_version::Column::State.eq(ConnectorVersionState::Active))
            .filter(connector_version::Column::DeletedAt.is_null())
            .all(&txn)
            .await?;

        let mut archived = Vec::new();
        for candidate in candidates {
            let references = connection::Entity::find()
                .filter(connection::Column::ConnectorId.eq(connector_id))
                .filter(connection::Column::ConnectorVersion.eq(candidate.version))
                .filter(connection::Column::DeletedAt.is_null())
                .count(&txn)
                .await?;
            if references > 0 {
                continue;
            }

            ConnectorVersion::update_many()
                .col_expr(
                    connector_version::Column::State,
                    Expr::value(ConnectorVersionState::Archived),
                )
                .col_expr(
                    connector_version::Column::UpdatedAt,
                    Expr::value(Utc::now().fixed_offset()),
                )
                .filter(connector_version::Column::ConnectorId.eq(connector_id))
                .filter(connector_version::Column::Version.eq(candidate.version))
                .exec(&txn)
                .await?;
            archived.push(candidate.version);
        }

        txn.commit().await?;

        if !archived.is_empty() {
            tracing::info!(connector_id = %connector_id, versions = ?archived, "Archived unreferenced connector versions");
        }
        Ok(archived)
    }

    /// Decrypts and parses the definition stored on `model`.
    pub fn load_definition(&self, model: &connector_version::Model) -> Result<ConnectorDefinition> {
        let bytes = self.encryptor.decrypt_for_connector_version(
            model.connector_id,
            model.version,
            &model.encrypted_definition,
        )?;
        ConnectorDefinition::from_bytes(&bytes)
    }

    fn live(connector_id: Uuid) -> sea_orm::Select<ConnectorVersion> {
        ConnectorVersion::find()
            .filter(connector_version::Column::ConnectorId.eq(connector_id))
            .filter(connector_version::Column::DeletedAt.is_null())
    }

    /// Highest version ever written for the connector, soft-deleted rows
    /// included so numbers are never reused. `0` when none exist.
    async fn max_version(txn: &DatabaseTransaction, connector_id: Uuid) -> Result<i64> {
        let max: Option<Option<i64>> = ConnectorVersion::find()
            .select_only()
            .column_as(connector_version::Column::Version.max(), "max_version")
            .filter(connector_version::Column::ConnectorId.eq(connector_id))
            .into_tuple()
            .one(txn)
            .await?;
        Ok(max.flatten().unwrap_or(0))
    }

    async fn apply_state_side_effects(
        txn: &DatabaseTransaction,
        connector_id: Uuid,
        version: i64,
        new_state: ConnectorVersionState,
    ) -> Result<()> {
        let demote_to = match new_state {
            ConnectorVersionState::Primary => ConnectorVersionState::Active,
            ConnectorVersionState::Draft => ConnectorVersionState::Archived,
            _ => return Ok(()),
        };

        let result = ConnectorVersion::update_many()
            .col_expr(connector_version::Column::State, Expr::value(demote_to))
            .col_expr(
                connector_version::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(connector_version::Column::ConnectorId.eq(connector_id))
            .filter(connector_version::Column::State.eq(new_state))
            .filter(connector_version::Column::Version.ne(version))
            .filter(connector_version::Column::DeletedAt.is_null())
            .exec(txn)
            .await?;

        if new_state == ConnectorVersionState::Primary && result.rows_affected > 1 {
            return Err(Error::Violation(format!(
                "connector {} had {} primary versions",
                connector_id, result.rows_affected
            )));
        }
        if result.rows_affected > 0 {
            tracing::debug!(
                connector_id = %connector_id,
                from = %new_state,
                to = %demote_to,
                count = result.rows_affected,
                "Demoted sibling connector versions"
            );
        }
        Ok(())
    }

    fn expect_single_row(rows_affected: u64, connector_id: Uuid, version: i64) -> Result<()> {
        match rows_affected {
            0 => Err(Error::not_found(
                "connector version",
                format!("{}@{}", connector_id, version),
            )),
            1 => Ok(()),
            n => Err(Error::Violation(format!(
                "updating connector {} version {} affected {} rows",
                connector_id, version, n
            ))),
        }
    }

    async fn fetch_in(
        txn: &DatabaseTransaction,
        connector_id: Uuid,
        version: i64,
    ) -> Result<connector_version::Model> {
        ConnectorVersion::find_by_id((connector_id, version))
            .one(txn)
            .await?
            .ok_or_else(|| {
                Error::Violation(format!(
                    "connector {} version {} vanished inside its own transaction",
                    connector_id, version
                ))
            })
    }
}
