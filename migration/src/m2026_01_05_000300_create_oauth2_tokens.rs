//! Migration to create the oauth2_tokens table.
//!
//! Tokens are soft-deleted when superseded; the partial unique index guarantees a
//! single live token per connection even if two replacements race.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OAuth2Tokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuth2Tokens::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuth2Tokens::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(OAuth2Tokens::RefreshedFromId).uuid().null())
                    .col(
                        ColumnDef::new(OAuth2Tokens::EncryptedAccessToken)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2Tokens::EncryptedRefreshToken)
                            .binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(OAuth2Tokens::AccessTokenExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(OAuth2Tokens::Scopes).json_binary().not_null())
                    .col(
                        ColumnDef::new(OAuth2Tokens::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(OAuth2Tokens::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_oauth2_tokens_connection_deleted")
                    .table(OAuth2Tokens::Table)
                    .col(OAuth2Tokens::ConnectionId)
                    .col(OAuth2Tokens::DeletedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_oauth2_tokens_expires_at")
                    .table(OAuth2Tokens::Table)
                    .col(OAuth2Tokens::AccessTokenExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_oauth2_tokens_single_live \
                 ON oauth2_tokens (connection_id) \
                 WHERE deleted_at IS NULL",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP INDEX IF EXISTS idx_oauth2_tokens_single_live")
            .await?;

        manager
            .drop_table(Table::drop().table(OAuth2Tokens::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OAuth2Tokens {
    #[sea_orm(iden = "oauth2_tokens")]
    Table,
    Id,
    ConnectionId,
    RefreshedFromId,
    EncryptedAccessToken,
    EncryptedRefreshToken,
    AccessTokenExpiresAt,
    Scopes,
    CreatedAt,
    DeletedAt,
}
