//! OAuth2 token store
//!
//! Tokens are replaced, never updated: inserting a token soft-deletes every
//! live token of the same connection inside the same transaction.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::connection::{self, ConnectionState};
use crate::models::oauth2_token::{self, Entity as OAuth2Token};

/// Rows fetched per page by [`OAuth2TokenRepository::enumerate_expiring_within`].
pub const ENUMERATE_PAGE_SIZE: u64 = 100;

/// Already-encrypted token material ready to be stored.
#[derive(Debug, Clone)]
pub struct NewOAuth2Token {
    pub connection_id: Uuid,
    pub refreshed_from_id: Option<Uuid>,
    pub encrypted_access_token: Vec<u8>,
    pub encrypted_refresh_token: Option<Vec<u8>>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

/// A live token together with its owning connection.
pub type TokenWithConnection = (oauth2_token::Model, connection::Model);

#[derive(Debug, Clone)]
pub struct OAuth2TokenRepository {
    pub db: Arc<DatabaseConnection>,
}

impl OAuth2TokenRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Replaces the live token of a connection.
    pub async fn insert(&self, token: NewOAuth2Token) -> Result<oauth2_token::Model> {
        let scopes = serde_json::to_value(&token.scopes)
            .map_err(|e| Error::Validation(format!("scopes are not serializable: {}", e)))?;

        let txn = self.db.begin().await?;
        let now = Utc::now().fixed_offset();

        let superseded = OAuth2Token::update_many()
            .col_expr(oauth2_token::Column::DeletedAt, Expr::value(now))
            .filter(oauth2_token::Column::ConnectionId.eq(token.connection_id))
            .filter(oauth2_token::Column::DeletedAt.is_null())
            .exec(&txn)
            .await?;

        let id = Uuid::new_v4();
        OAuth2Token::insert(oauth2_token::ActiveModel {
            id: Set(id),
            connection_id: Set(token.connection_id),
            refreshed_from_id: Set(token.refreshed_from_id),
            encrypted_access_token: Set(token.encrypted_access_token),
            encrypted_refresh_token: Set(token.encrypted_refresh_token),
            access_token_expires_at: Set(token.access_token_expires_at.map(|at| at.fixed_offset())),
            scopes: Set(scopes),
            created_at: Set(now),
            deleted_at: Set(None),
        })
        .exec_without_returning(&txn)
        .await?;

        let inserted = OAuth2Token::find_by_id(id).one(&txn).await?.ok_or_else(|| {
            Error::Violation(format!("token {} missing right after insert", id))
        })?;
        txn.commit().await?;

        tracing::debug!(
            connection_id = %token.connection_id,
            token_id = %id,
            superseded = superseded.rows_affected,
            "OAuth2 token stored"
        );
        Ok(inserted)
    }

    /// Newest live token for the connection.
    pub async fn get(&self, connection_id: Uuid) -> Result<oauth2_token::Model> {
        OAuth2Token::find()
            .filter(oauth2_token::Column::ConnectionId.eq(connection_id))
            .filter(oauth2_token::Column::DeletedAt.is_null())
            .order_by_desc(oauth2_token::Column::CreatedAt)
            .order_by_desc(oauth2_token::Column::Id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| Error::not_found("oauth2 token", connection_id))
    }

    /// Soft delete of one token; idempotent.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        OAuth2Token::update_many()
            .col_expr(
                oauth2_token::Column::DeletedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(oauth2_token::Column::Id.eq(id))
            .filter(oauth2_token::Column::DeletedAt.is_null())
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Soft delete of every live token of a connection; returns how many were live.
    pub async fn delete_all_for_connection(&self, connection_id: Uuid) -> Result<u64> {
        let result = OAuth2Token::update_many()
            .col_expr(
                oauth2_token::Column::DeletedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(oauth2_token::Column::ConnectionId.eq(connection_id))
            .filter(oauth2_token::Column::DeletedAt.is_null())
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Pages through live tokens of live, `ready` connections whose access token
    /// expires at or before `now + within`, already expired ones included.
    ///
    /// Stops after a short page or when `on_page` returns `ControlFlow::Break`.
    /// Returns the number of rows delivered.
    pub async fn enumerate_expiring_within<F, Fut>(
        &self,
        within: chrono::Duration,
        mut on_page: F,
    ) -> Result<u64>
    where
        F: FnMut(Vec<TokenWithConnection>) -> Fut,
        Fut: Future<Output = Result<ControlFlow<()>>>,
    {
        let cutoff = (Utc::now() + within).fixed_offset();
        let mut after: Option<(DateTimeWithTimeZone, Uuid)> = None;
        let mut delivered = 0u64;

        loop {
            let mut query = OAuth2Token::find()
                .find_also_related(connection::Entity)
                .filter(oauth2_token::Column::DeletedAt.is_null())
                .filter(oauth2_token::Column::AccessTokenExpiresAt.is_not_null())
                .filter(oauth2_token::Column::AccessTokenExpiresAt.lte(cutoff))
                .filter(connection::Column::DeletedAt.is_null())
                .filter(connection::Column::State.eq(ConnectionState::Ready));

            // Keyset paging; concurrent refreshes remove rows from this set.
            if let Some((expires_at, id)) = after {
                query = query.filter(
                    Condition::any()
                        .add(oauth2_token::Column::AccessTokenExpiresAt.gt(expires_at))
                        .add(
                            Condition::all()
                                .add(oauth2_token::Column::AccessTokenExpiresAt.eq(expires_at))
                                .add(oauth2_token::Column::Id.gt(id)),
                        ),
                );
            }

            let rows = query
                .order_by_asc(oauth2_token::Column::AccessTokenExpiresAt)
                .order_by_asc(oauth2_token::Column::Id)
                .limit(ENUMERATE_PAGE_SIZE)
                .all(&*self.db)
                .await?;

            let fetched = rows.len() as u64;
            after = rows.last().and_then(|(token, _)| {
                token
                    .access_token_expires_at
                    .map(|expires_at| (expires_at, token.id))
            });

            let page: Vec<TokenWithConnection> = rows
                .into_iter()
                .filter_map(|(token, conn)| conn.map(|conn| (token, conn)))
                .collect();

            if !page.is_empty() {
                delivered += page.len() as u64;
                if on_page(page).await?.is_break() {
                    break;
                }
            }

            if fetched < ENUMERATE_PAGE_SIZE || after.is_none() {
                break;
            }
        }

        Ok(delivered)
    }
}
