//! Lease lock engine
//!
//! Mutual exclusion over an expiring key:
//! - Acquire: atomic set-if-absent with TTL; on contention retry after a fixed
//!   backoff (plus optional jitter)
//! - Hold: a renewal task extends the TTL while the value still carries this
//!   acquisition's token
//! - Release: compare-and-delete against the token
//!
//! If the holding process dies the renewals stop and the key expires on its
//! own, so a crashed holder blocks others for at most one TTL.

mod renewal;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dlock_store::ExpiringKeyStore;
use rand::Rng;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use self::renewal::{RenewalRegistry, RenewalTask};
use crate::error::LockResult;
use crate::lock::DistributedLock;
use crate::metrics;
use crate::settings::LeaseSettings;
use crate::token::OwnerToken;

const BACKEND: &str = "lease";

/// Lease-based [`DistributedLock`] over an [`ExpiringKeyStore`].
pub struct LeaseLock {
    store: Arc<dyn ExpiringKeyStore>,
    settings: LeaseSettings,
    renewals: RenewalRegistry,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn ExpiringKeyStore>, settings: LeaseSettings) -> LockResult<Self> {
        settings.validate()?;
        info!(
            ttl_ms = settings.ttl_ms,
            renew_interval_ms = settings.renew_interval_ms,
            retry_interval_ms = settings.retry_interval_ms,
            "Lease lock engine initialized"
        );
        Ok(Self {
            store,
            settings,
            renewals: Arc::new(DashMap::new()),
        })
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    /// Whether this engine currently holds (and renews) `name`.
    pub fn is_held(&self, name: &str) -> bool {
        self.renewals.contains_key(name)
    }

    /// Stop every renewal task without deleting any lease.
    ///
    /// This is what a process crash looks like to other contenders: the
    /// leases stay until their TTL runs out.
    pub fn shutdown(&self) {
        let names: Vec<String> = self.renewals.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.renewals.remove(&name) {
                handle.cancel();
            }
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.settings.key_prefix, name)
    }

    fn backoff(&self) -> Duration {
        let base = self.settings.retry_interval();
        if self.settings.retry_jitter_ms == 0 {
            return base;
        }
        let jitter = rand::rng().random_range(0..=self.settings.retry_jitter_ms);
        base + Duration::from_millis(jitter)
    }

    /// One atomic acquisition attempt; starts renewal on success.
    async fn try_acquire(&self, name: &str) -> LockResult<bool> {
        let key = self.key(name);
        let token = OwnerToken::generate();
        let ttl = self.settings.ttl();

        if !self
            .store
            .set_if_absent_with_ttl(&key, token.as_str(), ttl)
            .await?
        {
            return Ok(false);
        }

        debug!(name = %name, token = %token, "Lease acquired");
        self.start_renewal(name, token);
        metrics::record_acquire(BACKEND);
        Ok(true)
    }

    fn start_renewal(&self, name: &str, token: OwnerToken) {
        RenewalTask::new(
            self.store.clone(),
            name,
            self.key(name),
            token,
            self.settings.ttl(),
            self.settings.renew_interval(),
        )
        .start(&self.renewals);
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl DistributedLock for LeaseLock {
    async fn lock(&self, name: &str) -> LockResult<()> {
        loop {
            if self.try_acquire(name).await? {
                return Ok(());
            }
            sleep(self.backoff()).await;
        }
    }

    async fn try_lock(&self, name: &str, wait: Duration) -> LockResult<bool> {
        let deadline = Instant::now() + wait;
        loop {
            if self.try_acquire(name).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                metrics::record_timeout(BACKEND);
                return Ok(false);
            }
            sleep(self.backoff().min(deadline - now)).await;
        }
    }

    async fn release(&self, name: &str) -> LockResult<bool> {
        let Some((_, handle)) = self.renewals.remove(name) else {
            metrics::record_release(BACKEND, false);
            return Ok(false);
        };
        let token = handle.token.clone();
        handle.cancel();

        let released = match self
            .store
            .delete_if_value_equals(&self.key(name), token.as_str())
            .await
        {
            Ok(released) => released,
            Err(e) => {
                // Still ours as far as we know; keep it alive so the caller can retry
                warn!(name = %name, token = %token, error = %e, "Lease release failed");
                self.start_renewal(name, token);
                return Err(e.into());
            }
        };
        debug!(name = %name, token = %token, released, "Lease released");
        metrics::record_release(BACKEND, released);
        Ok(released)
    }
}
