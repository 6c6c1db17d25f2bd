//! Migration to create the connector_versions table.
//!
//! Rows are keyed by `(connector_id, version)`. A partial unique index keeps at
//! most one live `primary` version per connector.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ConnectorVersions::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ConnectorVersions::ConnectorId).uuid().not_null())
                    .col(ColumnDef::new(ConnectorVersions::Version).big_integer().not_null())
                    .col(ColumnDef::new(ConnectorVersions::Namespace).text().not_null())
                    .col(
                        ColumnDef::new(ConnectorVersions::State)
                            .text()
                            .not_null()
                            .default("draft"),
                    )
                    .col(ColumnDef::new(ConnectorVersions::ConnectorType).text().not_null())
                    .col(ColumnDef::new(ConnectorVersions::Hash).text().not_null())
                    .col(
                        ColumnDef::new(ConnectorVersions::EncryptedDefinition)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectorVersions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ConnectorVersions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ConnectorVersions::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(ConnectorVersions::ConnectorId)
                            .col(ConnectorVersions::Version),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connector_versions_state")
                    .table(ConnectorVersions::Table)
                    .col(ConnectorVersions::ConnectorId)
                    .col(ConnectorVersions::State)
                    .to_owned(),
            )
            .await?;

        // Partial indexes are supported by both Postgres and SQLite but not by the
        // index builder, so this one is issued as raw SQL.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_connector_versions_single_primary \
                 ON connector_versions (connector_id) \
                 WHERE state = 'primary' AND deleted_at IS NULL",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP INDEX IF EXISTS idx_connector_versions_single_primary")
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_connector_versions_state")
                    .table(ConnectorVersions::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ConnectorVersions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ConnectorVersions {
    Table,
    ConnectorId,
    Version,
    Namespace,
    State,
    ConnectorType,
    Hash,
    EncryptedDefinition,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
