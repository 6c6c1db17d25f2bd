//! Distributed mutex on top of a [`KeyValueStore`].
//!
//! A lock is a store entry holding a random owner token. It expires after
//! `lock_duration` so a crashed holder cannot wedge it forever, and release
//! only deletes the entry if the token still matches, so a holder whose lease
//! expired never frees a lock that someone else has since taken.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use super::KeyValueStore;
use crate::error::{Error, Result};

const KEY_PREFIX: &str = "mutex:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexOptions {
    /// How long an acquired lock stays valid without being released
    pub lock_duration: Duration,
    /// Total time spent retrying acquisition before giving up
    pub retry_for: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl MutexOptions {
    /// Lock duration and retry budget both equal to `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            lock_duration: timeout,
            retry_for: timeout,
            ..Self::default()
        }
    }
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            retry_for: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Hands out named mutexes sharing one backing store.
#[derive(Clone)]
pub struct MutexFactory {
    store: Arc<dyn KeyValueStore>,
}

impl MutexFactory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn create(&self, name: impl Into<String>, options: MutexOptions) -> DistributedMutex {
        DistributedMutex {
            store: self.store.clone(),
            name: name.into(),
            options,
        }
    }
}

pub struct DistributedMutex {
    store: Arc<dyn KeyValueStore>,
    name: String,
    options: MutexOptions,
}

/// Proof of ownership returned by [`DistributedMutex::lock`].
#[must_use = "a held lock must be released with `DistributedMutex::unlock`"]
#[derive(Debug)]
pub struct LockGuard {
    owner: Vec<u8>,
}

impl DistributedMutex {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> String {
        format!("{}{}", KEY_PREFIX, self.name)
    }

    /// Acquires the lock, retrying with jittered exponential backoff until
    /// `retry_for` elapses.
    pub async fn lock(&self) -> Result<LockGuard> {
        let owner = Uuid::new_v4().as_bytes().to_vec();
        let key = self.key();
        let deadline = Instant::now() + self.options.retry_for;
        let mut backoff = self.options.initial_backoff;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self
                .store
                .set_if_absent(&key, owner.clone(), self.options.lock_duration)
                .await?
            {
                tracing::debug!(lock = %self.name, attempts, "Lock acquired");
                return Ok(LockGuard { owner });
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(lock = %self.name, attempts, "Lock acquisition timed out");
                return Err(Error::LockTimeout {
                    name: self.name.clone(),
                });
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let delay = (backoff + Duration::from_millis(jitter_ms)).min(deadline - now);
            sleep(delay).await;
            backoff = (backoff * 2).min(self.options.max_backoff);
        }
    }

    /// Releases a lock taken by [`lock`](Self::lock). Returns `false` when the
    /// lease had already expired and the lock was no longer ours.
    pub async fn unlock(&self, guard: LockGuard) -> Result<bool> {
        let released = self
            .store
            .delete_if_equals(&self.key(), &guard.owner)
            .await?;
        if !released {
            tracing::warn!(lock = %self.name, "Lock lease expired before release");
        }
        Ok(released)
    }

    /// Runs `f` while holding the lock and releases it afterwards, whatever
    /// `f` returned.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.lock().await?;
        let outcome = f().await;
        if let Err(err) = self.unlock(guard).await {
            tracing::error!(lock = %self.name, error = %err, "Failed to release lock");
        }
        outcome
    }
}
