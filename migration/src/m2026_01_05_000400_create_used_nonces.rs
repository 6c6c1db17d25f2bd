//! Migration to create the used_nonces table backing single-use redirect tokens.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UsedNonces::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(UsedNonces::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(UsedNonces::RetainUntil)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(UsedNonces::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_used_nonces_retain_until")
                    .table(UsedNonces::Table)
                    .col(UsedNonces::RetainUntil)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UsedNonces::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum UsedNonces {
    Table,
    Id,
    RetainUntil,
    CreatedAt,
}
