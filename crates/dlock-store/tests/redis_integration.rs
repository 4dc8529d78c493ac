//! Redis adapter integration tests.
//!
//! These tests require a running Redis server on localhost:6379.
//!
//! To run these tests:
//!   cargo test -p dlock-store --features redis-backend --test redis_integration -- --ignored
#![cfg(feature = "redis-backend")]

use std::time::Duration;

use dlock_store::{ExpiringKeyStore, RedisKeyStore};

const REDIS_URL: &str = "redis://127.0.0.1:6379/";

fn unique_key(name: &str) -> String {
    format!(
        "dlock-test:{}:{}",
        name,
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}

#[tokio::test]
#[ignore]
async fn test_redis_set_if_absent_and_compare_delete() -> anyhow::Result<()> {
    let store = RedisKeyStore::connect(REDIS_URL).await?;
    let key = unique_key("cas");
    let ttl = Duration::from_secs(5);

    assert!(store.set_if_absent_with_ttl(&key, "owner-1", ttl).await?);
    assert!(!store.set_if_absent_with_ttl(&key, "owner-2", ttl).await?);
    assert_eq!(store.get(&key).await?, Some("owner-1".to_string()));

    assert!(!store.delete_if_value_equals(&key, "owner-2").await?);
    assert!(store.delete_if_value_equals(&key, "owner-1").await?);
    assert_eq!(store.get(&key).await?, None);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_redis_key_expires() -> anyhow::Result<()> {
    let store = RedisKeyStore::connect(REDIS_URL).await?;
    let key = unique_key("ttl");

    assert!(
        store
            .set_if_absent_with_ttl(&key, "owner-1", Duration::from_millis(100))
            .await?
    );
    assert!(store.set_ttl(&key, Duration::from_millis(300)).await?);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.get(&key).await?, Some("owner-1".to_string()));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.get(&key).await?, None);
    assert!(!store.set_ttl(&key, Duration::from_millis(100)).await?);
    Ok(())
}
