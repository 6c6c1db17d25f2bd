//! Database migrations for the authorization proxy.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_000100_create_connector_versions;
mod m2026_01_05_000200_create_connections;
mod m2026_01_05_000300_create_oauth2_tokens;
mod m2026_01_05_000400_create_used_nonces;
mod m2026_01_05_000500_create_ephemeral_entries;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_000100_create_connector_versions::Migration),
            Box::new(m2026_01_05_000200_create_connections::Migration),
            Box::new(m2026_01_05_000300_create_oauth2_tokens::Migration),
            Box::new(m2026_01_05_000400_create_used_nonces::Migration),
            Box::new(m2026_01_05_000500_create_ephemeral_entries::Migration),
        ]
    }
}
