//! # Ephemeral Keyed Store
//!
//! Short-lived records (OAuth2 handshake state, lock ownership) live behind the
//! [`KeyValueStore`] trait. Two backends are provided: an in-process map for
//! single-node deployments and tests, and a table in the primary database that
//! is shared by every process pointed at it.
//!
//! Every entry carries a TTL. Expired entries are invisible to all operations
//! even before they are physically removed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AppConfig, EphemeralBackend};
use crate::error::Result;

pub mod database;
pub mod memory;
pub mod mutex;

pub use database::DatabaseKeyValueStore;
pub use memory::MemoryKeyValueStore;
pub use mutex::{DistributedMutex, MutexFactory, MutexOptions};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Writes `value` under `key`, replacing any previous entry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removes `key`. Returns `true` only if a live entry was removed, which
    /// makes delete usable as a consume-once primitive.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Writes `value` only if no live entry exists. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Removes `key` only if its live value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Overwrites `key` with `value` only if its live value still equals
    /// `expected`. A consumed or expired entry is never brought back.
    async fn replace_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool>;

    /// Physically removes expired entries, returning how many were dropped.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Builds the configured backend.
pub fn build_store(
    config: &AppConfig,
    db: Arc<sea_orm::DatabaseConnection>,
) -> Arc<dyn KeyValueStore> {
    match config.ephemeral_backend {
        EphemeralBackend::Database => Arc::new(DatabaseKeyValueStore::new(db)),
        EphemeralBackend::Memory => {
            tracing::warn!("Using in-memory ephemeral store; state is not shared across processes");
            Arc::new(MemoryKeyValueStore::new())
        }
    }
}
