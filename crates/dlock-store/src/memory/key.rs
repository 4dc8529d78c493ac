// In-memory expiring key store
// Expiry is evaluated lazily on access against the tokio clock

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use crate::error::{StoreError, StoreResult};
use crate::key::ExpiringKeyStore;

struct KeyEntry {
    value: String,
    expires_at: Instant,
}

impl KeyEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory [`ExpiringKeyStore`] backed by `DashMap`.
///
/// Clones share the same data, so several engines built from clones of one
/// store contend exactly like separate processes talking to one Redis.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    entries: Arc<DashMap<String, KeyEntry>>,
    offline: Arc<AtomicBool>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a network partition: while offline every call fails with
    /// [`StoreError::Connection`]. Entries keep expiring in the meantime.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining TTL of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.expires_at.saturating_duration_since(Instant::now()))
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExpiringKeyStore for MemoryKeyStore {
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.check_online()?;
        let fresh = KeyEntry {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        let value = self
            .entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        Ok(value)
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_online()?;
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_value_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check_online()?;
        Ok(self
            .entries
            .remove_if(key, |_, e| !e.is_expired() && e.value == expected)
            .is_some())
    }
}
