//! Migration to create the ephemeral_entries table.
//!
//! Backs the database flavour of the keyed store: OAuth2 state records and
//! distributed mutex leases shared by every worker process.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EphemeralEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EphemeralEntries::Key)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EphemeralEntries::Value).binary().not_null())
                    .col(
                        ColumnDef::new(EphemeralEntries::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_ephemeral_entries_expires_at")
                    .table(EphemeralEntries::Table)
                    .col(EphemeralEntries::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EphemeralEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum EphemeralEntries {
    Table,
    Key,
    Value,
    ExpiresAt,
}
