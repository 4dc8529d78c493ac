//! Expiring key-value store capability used by the lease backend

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// Key-value store whose entries can carry a time-to-live.
///
/// Every method is a single round trip against the store. Implementations must
/// make `set_if_absent_with_ttl` and `delete_if_value_equals` atomic on the
/// server side; a key must never exist without its expiry.
#[async_trait]
pub trait ExpiringKeyStore: Send + Sync {
    /// Set `key` to `value` with the given TTL only if the key is absent.
    ///
    /// Returns `true` when the key was created.
    async fn set_if_absent_with_ttl(&self, key: &str, value: &str, ttl: Duration)
    -> StoreResult<bool>;

    /// Read the current value of `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Reset the TTL of an existing key. Returns `false` when the key is gone.
    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete `key` only if its value equals `expected`.
    async fn delete_if_value_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;
}
