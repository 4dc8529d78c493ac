//! Redis-backed expiring key store.
//!
//! - Acquire: `SET key value NX PX ttl` (one atomic command, so a key can
//!   never exist without its expiry)
//! - Renew: `PEXPIRE`
//! - Release: Lua compare-and-delete, so a lease that expired and was taken
//!   by another owner is never deleted by the previous one

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use tracing::info;

use crate::error::StoreResult;
use crate::key::ExpiringKeyStore;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// [`ExpiringKeyStore`] over a Redis connection manager.
///
/// `ConnectionManager` multiplexes one connection and reconnects on failure;
/// clones are cheap and share it.
#[derive(Clone)]
pub struct RedisKeyStore {
    manager: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisKeyStore {
    /// Connect to Redis.
    ///
    /// Example URLs:
    /// - `redis://127.0.0.1/`
    /// - `redis://:password@host:6379/0`
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self {
            manager,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl ExpiringKeyStore for RedisKeyStore {
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn delete_if_value_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
