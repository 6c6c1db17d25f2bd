//! Integration tests for the database-backed ephemeral store, the distributed
//! mutex running on it, and redirect-token nonce bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use authproxy::ephemeral::{DatabaseKeyValueStore, KeyValueStore, MutexFactory, MutexOptions};
use authproxy::error::Error;
use authproxy::repositories::UsedNonceRepository;
use chrono::Utc;
use tokio::task::JoinSet;
use uuid::Uuid;

mod test_utils;
use test_utils::setup_test_db_arc;

const MINUTE: Duration = Duration::from_secs(60);

#[tokio::test]
async fn set_get_and_delete_report_liveness() -> Result<()> {
    let store = DatabaseKeyValueStore::new(setup_test_db_arc().await?);

    assert_eq!(store.get("state:1").await?, None);
    store.set("state:1", b"first".to_vec(), MINUTE).await?;
    store.set("state:1", b"second".to_vec(), MINUTE).await?;
    assert_eq!(store.get("state:1").await?, Some(b"second".to_vec()));

    assert!(store.delete("state:1").await?);
    assert!(!store.delete("state:1").await?);
    assert_eq!(store.get("state:1").await?, None);
    Ok(())
}

#[tokio::test]
async fn expired_entries_are_invisible_and_purged() -> Result<()> {
    let store = DatabaseKeyValueStore::new(setup_test_db_arc().await?);

    store.set("gone", b"x".to_vec(), Duration::ZERO).await?;
    store.set("kept", b"y".to_vec(), MINUTE).await?;

    assert_eq!(store.get("gone").await?, None);
    // An expired entry does not count as consumed.
    assert!(!store.delete("gone").await?);
    assert!(!store.delete_if_equals("gone", b"x").await?);

    store.set("gone-too", b"z".to_vec(), Duration::ZERO).await?;
    assert_eq!(store.purge_expired().await?, 1);
    assert_eq!(store.get("kept").await?, Some(b"y".to_vec()));
    Ok(())
}

#[tokio::test]
async fn set_if_absent_respects_live_entries_only() -> Result<()> {
    let store = DatabaseKeyValueStore::new(setup_test_db_arc().await?);

    assert!(store.set_if_absent("lock", b"a".to_vec(), MINUTE).await?);
    assert!(!store.set_if_absent("lock", b"b".to_vec(), MINUTE).await?);
    assert_eq!(store.get("lock").await?, Some(b"a".to_vec()));

    store.set("stale", b"old".to_vec(), Duration::ZERO).await?;
    assert!(store.set_if_absent("stale", b"new".to_vec(), MINUTE).await?);
    assert_eq!(store.get("stale").await?, Some(b"new".to_vec()));
    Ok(())
}

#[tokio::test]
async fn delete_if_equals_only_removes_matching_value() -> Result<()> {
    let store = DatabaseKeyValueStore::new(setup_test_db_arc().await?);
    store.set("lock", b"owner-1".to_vec(), MINUTE).await?;

    assert!(!store.delete_if_equals("lock", b"owner-2").await?);
    assert_eq!(store.get("lock").await?, Some(b"owner-1".to_vec()));

    assert!(store.delete_if_equals("lock", b"owner-1").await?);
    assert_eq!(store.get("lock").await?, None);
    Ok(())
}

#[tokio::test]
async fn mutex_on_database_store_serializes_holders() -> Result<()> {
    let store: Arc<dyn KeyValueStore> =
        Arc::new(DatabaseKeyValueStore::new(setup_test_db_arc().await?));
    let factory = MutexFactory::new(store);

    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let mut tasks = JoinSet::new();

    for _ in 0..4 {
        let mutex = factory.create(
            "connection:shared",
            MutexOptions {
                lock_duration: Duration::from_secs(5),
                retry_for: Duration::from_secs(5),
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
            },
        );
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        tasks.spawn(async move {
            mutex
                .with_lock(|| async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        });
    }

    while let Some(result) = tasks.join_next().await {
        result??;
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn mutex_times_out_while_held() -> Result<()> {
    let store: Arc<dyn KeyValueStore> =
        Arc::new(DatabaseKeyValueStore::new(setup_test_db_arc().await?));
    let factory = MutexFactory::new(store);

    let holder = factory.create("connection:busy", MutexOptions::with_timeout(MINUTE));
    let waiter = factory.create(
        "connection:busy",
        MutexOptions {
            retry_for: Duration::from_millis(50),
            initial_backoff: Duration::from_millis(10),
            ..MutexOptions::default()
        },
    );

    let guard = holder.lock().await?;
    let err = waiter.lock().await.unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert!(holder.unlock(guard).await?);
    Ok(())
}

#[tokio::test]
async fn nonces_are_single_use_until_purged() -> Result<()> {
    let nonces = UsedNonceRepository::new(setup_test_db_arc().await?);
    let nonce = Uuid::new_v4();

    assert!(nonces.use_nonce(nonce, Utc::now() + chrono::Duration::minutes(10)).await?);
    assert!(!nonces.use_nonce(nonce, Utc::now() + chrono::Duration::minutes(10)).await?);

    let stale = Uuid::new_v4();
    assert!(nonces.use_nonce(stale, Utc::now() - chrono::Duration::minutes(1)).await?);
    assert_eq!(nonces.purge_expired().await?, 1);

    // Purging the stale nonce leaves the live one burned.
    assert!(!nonces.use_nonce(nonce, Utc::now() + chrono::Duration::minutes(10)).await?);
    Ok(())
}

#[tokio::test]
async fn replace_if_equals_never_revives_a_consumed_entry() -> Result<()> {
    let store = DatabaseKeyValueStore::new(setup_test_db_arc().await?);
    store.set("oauth2-state:1", b"v1".to_vec(), MINUTE).await?;

    assert!(!store.replace_if_equals("oauth2-state:1", b"other", b"v2".to_vec(), MINUTE).await?);
    assert!(store.replace_if_equals("oauth2-state:1", b"v1", b"v2".to_vec(), MINUTE).await?);
    assert_eq!(store.get("oauth2-state:1").await?, Some(b"v2".to_vec()));

    assert!(store.delete("oauth2-state:1").await?);
    assert!(!store.replace_if_equals("oauth2-state:1", b"v2", b"v3".to_vec(), MINUTE).await?);
    assert_eq!(store.get("oauth2-state:1").await?, None);
    Ok(())
}
