//! Lease renewal (watchdog) task
//!
//! One task per held lease. Each tick re-reads the lease value and, while it
//! still carries this owner's token, pushes the expiry out by another TTL.
//! The task ends on its own when the lease is found in someone else's hands
//! or when the store has been unreachable for a full TTL.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dlock_store::{ExpiringKeyStore, StoreResult};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, warn};

use crate::metrics::{LEASE_LOST_TOTAL, LEASE_RENEWALS_TOTAL};
use crate::token::OwnerToken;

/// Registry entry for a held lease: the acquisition's token and its renewal task.
pub(crate) struct RenewalHandle {
    pub(crate) token: OwnerToken,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    pub(crate) fn cancel(self) {
        self.task.abort();
    }
}

/// Resource name -> renewal handle, owned by one lease engine.
pub(crate) type RenewalRegistry = Arc<DashMap<String, RenewalHandle>>;

/// Why a renewal task stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenewalExit {
    /// The key is gone or holds another owner's token
    Lost,
    /// The store stayed unreachable for longer than the TTL
    Ceded,
}

pub(crate) struct RenewalTask {
    store: Arc<dyn ExpiringKeyStore>,
    name: String,
    key: String,
    token: OwnerToken,
    ttl: Duration,
    period: Duration,
}

impl RenewalTask {
    pub(crate) fn new(
        store: Arc<dyn ExpiringKeyStore>,
        name: &str,
        key: String,
        token: OwnerToken,
        ttl: Duration,
        period: Duration,
    ) -> Self {
        Self {
            store,
            name: name.to_string(),
            key,
            token,
            ttl,
            period,
        }
    }

    /// Spawn the task and register it, replacing (and aborting) any stale
    /// handle left for the same name.
    pub(crate) fn start(self, registry: &RenewalRegistry) {
        let name = self.name.clone();
        let token = self.token.clone();
        let owned_registry = registry.clone();

        let task = tokio::spawn(async move {
            let exit = self.run().await;
            // Only remove our own entry; a newer acquisition may have replaced it
            owned_registry.remove_if(&self.name, |_, handle| handle.token == self.token);
            debug!(name = %self.name, exit = ?exit, "Lease renewal task stopped");
        });

        if let Some(stale) = registry.insert(name, RenewalHandle { token, task }) {
            stale.cancel();
        }
    }

    /// Renew until the lease is lost or ceded.
    pub(crate) async fn run(&self) -> RenewalExit {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the lease was just written
        ticker.tick().await;
        let mut last_renewed = Instant::now();

        loop {
            ticker.tick().await;
            match self.renew_once().await {
                Ok(true) => {
                    last_renewed = Instant::now();
                    metrics::counter!(LEASE_RENEWALS_TOTAL).increment(1);
                }
                Ok(false) => {
                    warn!(
                        name = %self.name,
                        token = %self.token,
                        "Lease lost: key expired or taken by another owner"
                    );
                    metrics::counter!(LEASE_LOST_TOTAL).increment(1);
                    return RenewalExit::Lost;
                }
                Err(e) if last_renewed.elapsed() >= self.ttl => {
                    error!(
                        name = %self.name,
                        token = %self.token,
                        error = %e,
                        "Lease expired while store was unreachable, giving up renewal"
                    );
                    metrics::counter!(LEASE_LOST_TOTAL).increment(1);
                    return RenewalExit::Ceded;
                }
                Err(e) => {
                    warn!(
                        name = %self.name,
                        error = %e,
                        "Lease renewal failed, will retry until the lease expires"
                    );
                }
            }
        }
    }

    async fn renew_once(&self) -> StoreResult<bool> {
        match self.store.get(&self.key).await? {
            Some(value) if value == self.token.as_str() => {
                self.store.set_ttl(&self.key, self.ttl).await
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlock_store::MemoryKeyStore;

    fn task(store: &MemoryKeyStore, token: &OwnerToken) -> RenewalTask {
        task_with_ttl(store, token, Duration::from_millis(100))
    }

    fn task_with_ttl(store: &MemoryKeyStore, token: &OwnerToken, ttl: Duration) -> RenewalTask {
        RenewalTask::new(
            Arc::new(store.clone()),
            "res",
            "res".to_string(),
            token.clone(),
            ttl,
            Duration::from_millis(50),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lease_alive() {
        let store = MemoryKeyStore::new();
        let token = OwnerToken::generate();
        store
            .set_if_absent_with_ttl("res", token.as_str(), Duration::from_millis(100))
            .await
            .unwrap();

        let registry: RenewalRegistry = Arc::new(DashMap::new());
        task(&store, &token).start(&registry);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(store.get("res").await.unwrap(), Some(token.to_string()));
        assert!(registry.contains_key("res"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_stops_when_taken_over() {
        let store = MemoryKeyStore::new();
        let token = OwnerToken::generate();
        // Someone else holds the key
        store
            .set_if_absent_with_ttl("res", "other", Duration::from_secs(10))
            .await
            .unwrap();

        let exit = task(&store, &token).run().await;
        assert_eq!(exit, RenewalExit::Lost);
        assert_eq!(store.get("res").await.unwrap(), Some("other".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_cedes_after_ttl_of_failures() {
        let store = MemoryKeyStore::new();
        let token = OwnerToken::generate();
        store
            .set_if_absent_with_ttl("res", token.as_str(), Duration::from_millis(100))
            .await
            .unwrap();
        store.set_offline(true);

        let started = Instant::now();
        let exit = task(&store, &token).run().await;
        assert_eq!(exit, RenewalExit::Ceded);
        // Tolerated failures up to the TTL, never beyond one extra period
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(150));

        // The lease was not resurrected
        store.set_offline(false);
        assert_eq!(store.get("res").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_tolerated() {
        let store = MemoryKeyStore::new();
        let token = OwnerToken::generate();
        let ttl = Duration::from_millis(150);
        store
            .set_if_absent_with_ttl("res", token.as_str(), ttl)
            .await
            .unwrap();

        let registry: RenewalRegistry = Arc::new(DashMap::new());
        task_with_ttl(&store, &token, ttl).start(&registry);

        // Renewed at t=50, then the store misses the t=100 tick
        tokio::time::sleep(Duration::from_millis(60)).await;
        store.set_offline(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.set_offline(false);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.get("res").await.unwrap(), Some(token.to_string()));
        assert!(registry.contains_key("res"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_replaces_stale_handle() {
        let store = MemoryKeyStore::new();
        let registry: RenewalRegistry = Arc::new(DashMap::new());

        let first = OwnerToken::generate();
        store
            .set_if_absent_with_ttl("res", first.as_str(), Duration::from_millis(100))
            .await
            .unwrap();
        task(&store, &first).start(&registry);

        let second = OwnerToken::generate();
        task(&store, &second).start(&registry);

        assert_eq!(registry.get("res").unwrap().token, second);
    }
}
