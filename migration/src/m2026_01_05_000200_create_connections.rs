//! Migration to create the connections table.
//!
//! A connection pins one connector version. Deleting a version never cascades,
//! so the reference carries no foreign key.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::Namespace).text().not_null())
                    .col(ColumnDef::new(Connections::ConnectorId).uuid().not_null())
                    .col(
                        ColumnDef::new(Connections::ConnectorVersion)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Connections::State)
                            .text()
                            .not_null()
                            .default("created"),
                    )
                    .col(ColumnDef::new(Connections::Labels).json_binary().not_null())
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_connector_version")
                    .table(Connections::Table)
                    .col(Connections::ConnectorId)
                    .col(Connections::ConnectorVersion)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_state")
                    .table(Connections::Table)
                    .col(Connections::State)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_connector_version")
                    .table(Connections::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_state")
                    .table(Connections::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    Namespace,
    ConnectorId,
    ConnectorVersion,
    State,
    Labels,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
