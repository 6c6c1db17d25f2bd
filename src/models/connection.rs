//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table,
//! which binds one end user to one pinned connector version.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub namespace: String,

    pub connector_id: Uuid,

    /// Exact connector version this connection was authorized against
    pub connector_version: i64,

    pub state: ConnectionState,

    /// Flat string-to-string label map
    #[sea_orm(column_type = "JsonBinary")]
    pub labels: Json,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
    pub deleted_at: Option<DateTimeWithTimeZone>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    ToSchema,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[sea_orm(string_value = "created")]
    #[default]
    Created,
    #[sea_orm(string_value = "ready")]
    Ready,
    #[sea_orm(string_value = "disabled")]
    Disabled,
    #[sea_orm(string_value = "disconnecting")]
    Disconnecting,
    #[sea_orm(string_value = "disconnected")]
    Disconnected,
}

impl ConnectionState {
    /// States from which the connection can only move further towards
    /// `disconnected`.
    pub fn is_terminal_phase(self) -> bool {
        matches!(self, Self::Disconnecting | Self::Disconnected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Disabled => "disabled",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::oauth2_token::Entity")]
    OAuth2Tokens,
}

impl Related<super::oauth2_token::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OAuth2Tokens.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
