//! Connector version entity model
//!
//! One row per `(connector_id, version)`. The definition blob is encrypted at
//! rest and its content hash is stored alongside for change detection.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connector_versions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub connector_id: Uuid,

    #[sea_orm(primary_key, auto_increment = false)]
    pub version: i64,

    /// Namespace the connector is published into; immutable once committed
    pub namespace: String,

    pub state: ConnectorVersionState,

    /// Third-party integration kind, e.g. `google-drive`
    pub connector_type: String,

    /// SHA-256 hex digest of the canonical definition JSON
    pub hash: String,

    pub encrypted_definition: Vec<u8>,

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
pub enum ConnectorVersionState {
    #[sea_orm(string_value = "draft")]
    #[default]
    Draft,
    #[sea_orm(string_value = "primary")]
    Primary,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "archived")]
    Archived,
}

impl ConnectorVersionState {
    /// Published versions are the ones new connections may be created against.
    pub fn is_published(self) -> bool {
        matches!(self, Self::Primary | Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Primary => "primary",
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for ConnectorVersionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
