//! Queue lock engine
//!
//! Fair mutual exclusion over a hierarchical store. Each acquisition appends an
//! ephemeral sequential entry under the resource's queue node; the owner of the
//! lowest entry holds the lock. Everyone else waits for a deletion
//! notification on the entry directly ahead of them, so a release (or a
//! holder's session expiring) wakes exactly one waiter.

mod dispatcher;
mod path;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dlock_store::{HierarchicalStore, StoreError, StoreResult};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use self::dispatcher::{HeldEntry, QueueInner, SessionWatch, WaitOutcome};
use self::path::QueuePath;
use crate::error::{LockError, LockResult};
use crate::lock::DistributedLock;
use crate::metrics;
use crate::settings::QueueSettings;
use crate::token::OwnerToken;

const BACKEND: &str = "queue";

/// Fair-queue [`DistributedLock`] over a [`HierarchicalStore`].
///
/// All locks taken through one engine share the store handle's session; when
/// that session ends every pending wait fails and every hold is dropped.
pub struct QueueLock {
    inner: Arc<QueueInner>,
    reconcile_handle: Option<JoinHandle<()>>,
}

impl QueueLock {
    /// Create the engine. When a reconciliation interval is configured this
    /// must be called from within a Tokio runtime.
    pub fn new(store: Arc<dyn HierarchicalStore>, settings: QueueSettings) -> LockResult<Self> {
        settings.validate()?;
        let reconcile_interval = settings.reconcile_interval();
        let inner = Arc::new(QueueInner::new(store, settings));

        inner.store.subscribe_session(Arc::new(SessionWatch {
            inner: Arc::downgrade(&inner),
        }));

        let reconcile_handle = match reconcile_interval {
            Some(period) => {
                let handle = Handle::try_current().map_err(|_| {
                    LockError::Config(
                        "queue.reconcile_interval_ms requires a Tokio runtime".to_string(),
                    )
                })?;
                Some(Self::spawn_reconcile(&handle, &inner, period))
            }
            None => None,
        };

        info!(
            entry_prefix = %inner.settings.entry_prefix,
            reconcile_interval_ms = inner.settings.reconcile_interval_ms,
            cleanup_retry_ms = inner.settings.cleanup_retry_ms,
            "Queue lock engine initialized"
        );
        Ok(Self {
            inner,
            reconcile_handle,
        })
    }

    /// Periodically re-evaluate every waiter in case a notification was lost.
    fn spawn_reconcile(
        handle: &Handle,
        inner: &Arc<QueueInner>,
        period: Duration,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        handle.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.reconcile().await;
            }
        })
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Whether this engine currently holds `name`.
    pub fn is_held(&self, name: &str) -> bool {
        self.inner.held.contains_key(name)
    }

    /// Number of callers currently parked in a queue.
    pub fn waiter_count(&self) -> usize {
        self.inner.waiter_count()
    }

    async fn ensure_queue(&self, path: &QueuePath) -> LockResult<()> {
        for node in path.ancestors() {
            self.inner.store.create_persistent(&node).await?;
        }
        Ok(())
    }

    /// Enqueue and wait, for at most `wait` if given.
    async fn acquire(&self, name: &str, wait: Option<Duration>) -> LockResult<bool> {
        let path = QueuePath::parse(name, &self.inner.settings.entry_prefix)?;
        self.ensure_queue(&path).await?;

        let token = OwnerToken::generate();
        let entry = self
            .inner
            .store
            .create_ephemeral_sequential(
                &path.entry_prefix(&self.inner.settings.entry_prefix),
                token.as_bytes(),
            )
            .await?;
        debug!(name = %name, entry = %entry, token = %token, "Queue entry created");

        let mut guard = PendingEntry::new(self.inner.clone(), entry.clone());
        let mut rx = self.inner.register(&entry, path.queue());
        self.inner.evaluate(&entry).await;

        let received = match wait {
            None => rx.await,
            Some(wait) => match timeout(wait, &mut rx).await {
                Ok(received) => received,
                Err(_) if self.inner.deregister(&entry) => {
                    guard.disarm();
                    self.inner.remove_entry(&entry).await?;
                    debug!(name = %name, entry = %entry, "Queue wait timed out");
                    metrics::record_timeout(BACKEND);
                    return Ok(false);
                }
                // Completed right at the deadline; take the outcome
                Err(_) => rx.await,
            },
        };
        guard.disarm();

        match received {
            Ok(WaitOutcome::Acquired) => {
                self.inner.held.insert(
                    name.to_string(),
                    HeldEntry {
                        path: entry.clone(),
                        token,
                    },
                );
                debug!(name = %name, entry = %entry, "Queue lock acquired");
                metrics::record_acquire(BACKEND);
                Ok(true)
            }
            Ok(WaitOutcome::SessionLost) => Err(StoreError::SessionExpired.into()),
            Ok(WaitOutcome::Failed(e)) => {
                // Retried in the background on failure
                let _ = self.inner.remove_entry(&entry).await;
                Err(e.into())
            }
            Ok(WaitOutcome::Vanished) => {
                error!(name = %name, entry = %entry, "Queue entry vanished while waiting");
                Err(LockError::ProtocolInvariantViolated {
                    name: name.to_string(),
                    reason: format!("queue entry {} vanished while waiting", entry),
                })
            }
            Err(_) => Err(LockError::ProtocolInvariantViolated {
                name: name.to_string(),
                reason: format!("wait registration for {} was dropped", entry),
            }),
        }
    }

    /// Delete the head of the queue if it carries `token`.
    async fn release_head(&self, path: &QueuePath, token: &OwnerToken) -> StoreResult<bool> {
        let entries = self.inner.sorted_entries(path.queue()).await?;
        let Some(head) = entries.first() else {
            return Ok(false);
        };
        let head = path.entry_path(head);
        let Some(node) = self.inner.store.get(&head).await? else {
            return Ok(false);
        };
        if !token.matches(&node.value) {
            return Ok(false);
        }
        // The deletion notification wakes the next waiter
        match self.inner.store.delete(&head, Some(node.version)).await {
            Ok(()) => Ok(true),
            Err(StoreError::NoNode(_)) | Err(StoreError::BadVersion { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        if let Some(handle) = self.reconcile_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl DistributedLock for QueueLock {
    async fn lock(&self, name: &str) -> LockResult<()> {
        self.acquire(name, None).await.map(|_| ())
    }

    async fn try_lock(&self, name: &str, wait: Duration) -> LockResult<bool> {
        self.acquire(name, Some(wait)).await
    }

    async fn release(&self, name: &str) -> LockResult<bool> {
        let path = QueuePath::parse(name, &self.inner.settings.entry_prefix)?;
        let Some((_, held)) = self.inner.held.remove(name) else {
            metrics::record_release(BACKEND, false);
            return Ok(false);
        };

        let outcome = self.release_head(&path, &held.token).await;

        match outcome {
            Ok(released) => {
                if released {
                    debug!(name = %name, entry = %held.path, "Queue lock released");
                } else {
                    warn!(
                        name = %name,
                        entry = %held.path,
                        "Queue lock was no longer held at release"
                    );
                }
                metrics::record_release(BACKEND, released);
                Ok(released)
            }
            Err(e) => {
                // Still ours as far as we know; let the caller retry
                self.inner.held.insert(name.to_string(), held);
                Err(e.into())
            }
        }
    }
}

/// Removes the wait registration and queue entry if an acquisition is
/// abandoned before it completes (e.g. the caller's future is dropped).
struct PendingEntry {
    inner: Arc<QueueInner>,
    entry: String,
    armed: bool,
}

impl PendingEntry {
    fn new(inner: Arc<QueueInner>, entry: String) -> Self {
        Self {
            inner,
            entry,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.deregister(&self.entry);
        let inner = self.inner.clone();
        let entry = std::mem::take(&mut self.entry);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                let _ = inner.remove_entry(&entry).await;
            });
        }
    }
}
