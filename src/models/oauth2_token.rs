//! OAuth2 token entity model
//!
//! Token material is always stored encrypted under the owning connection's key
//! context. `refreshed_from_id` is lineage only; the referenced row is usually
//! already soft-deleted.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "oauth2_tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub connection_id: Uuid,

    pub refreshed_from_id: Option<Uuid>,

    pub encrypted_access_token: Vec<u8>,

    pub encrypted_refresh_token: Option<Vec<u8>>,

    /// `None` for providers that issue non-expiring access tokens
    pub access_token_expires_at: Option<DateTimeWithTimeZone>,

    /// Granted scopes as a JSON array of strings
    #[sea_orm(column_type = "JsonBinary")]
    pub scopes: Json,

    pub created_at: DateTimeWithTimeZone,
    pub deleted_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    pub fn scope_list(&self) -> Vec<String> {
        serde_json::from_value(self.scopes.clone()).unwrap_or_default()
    }

    /// True when the access token expires at or before `now + window`.
    /// Tokens without an expiry never need a refresh.
    pub fn expires_within(&self, window: chrono::Duration) -> bool {
        match self.access_token_expires_at {
            Some(expires_at) => expires_at <= chrono::Utc::now() + window,
            None => false,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connection::Entity",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
