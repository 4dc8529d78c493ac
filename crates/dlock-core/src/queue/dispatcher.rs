//! Wait registry and notification dispatch for the queue engine
//!
//! Every caller that is not first in line parks on a oneshot channel keyed by
//! its entry path. Store notifications never promote a waiter directly: they
//! schedule a re-evaluation, which re-lists the queue and either promotes the
//! waiter, re-arms a watch on its current predecessor, or reports the entry
//! as gone. A waiter is completed at most once; completing one that has
//! already been cancelled is a no-op. At most one watch per waiter is armed on
//! any given predecessor.
//!
//! Entries this engine gave up on but could not delete are kept in a cleanup
//! set and retried until the store confirms they are gone.

use std::sync::{Arc, Weak};

use dashmap::{DashMap, DashSet};
use dlock_store::{HierarchicalStore, StoreError, StoreResult, WatchEvent, WatchListener};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::path::{entry_name, sorted_entries};
use crate::metrics::QUEUE_WAITERS;
use crate::settings::QueueSettings;
use crate::token::OwnerToken;

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The entry is now first in its queue
    Acquired,
    /// The session owning the entry ended
    SessionLost,
    /// The entry disappeared while still waiting
    Vanished,
    /// The store failed while re-evaluating the queue
    Failed(StoreError),
}

struct Waiter {
    queue: String,
    tx: oneshot::Sender<WaitOutcome>,
    /// Predecessor with a deletion watch armed on our behalf
    watching: Option<String>,
}

/// A lock held by this engine.
pub(crate) struct HeldEntry {
    pub(crate) path: String,
    pub(crate) token: OwnerToken,
}

pub(crate) struct QueueInner {
    pub(crate) store: Arc<dyn HierarchicalStore>,
    pub(crate) settings: QueueSettings,
    /// Entry path -> parked caller
    waiters: DashMap<String, Waiter>,
    /// Resource name -> held entry
    pub(crate) held: DashMap<String, HeldEntry>,
    /// Abandoned entries whose deletion is being retried
    cleanup: DashSet<String>,
}

impl QueueInner {
    pub(crate) fn new(store: Arc<dyn HierarchicalStore>, settings: QueueSettings) -> Self {
        Self {
            store,
            settings,
            waiters: DashMap::new(),
            held: DashMap::new(),
            cleanup: DashSet::new(),
        }
    }

    /// Park a caller on `entry` until [`QueueInner::finish`] completes it.
    pub(crate) fn register(&self, entry: &str, queue: &str) -> oneshot::Receiver<WaitOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(
            entry.to_string(),
            Waiter {
                queue: queue.to_string(),
                tx,
                watching: None,
            },
        );
        metrics::gauge!(QUEUE_WAITERS).increment(1.0);
        rx
    }

    /// Remove a waiter without completing it. Returns `false` if it had
    /// already been completed.
    pub(crate) fn deregister(&self, entry: &str) -> bool {
        if self.waiters.remove(entry).is_some() {
            metrics::gauge!(QUEUE_WAITERS).decrement(1.0);
            true
        } else {
            false
        }
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn cleanup_count(&self) -> usize {
        self.cleanup.len()
    }

    /// Forget the watch on `predecessor`, so the next evaluation arms a new one.
    fn unwatch(&self, entry: &str, predecessor: &str) {
        if let Some(mut waiter) = self.waiters.get_mut(entry)
            && waiter.watching.as_deref() == Some(predecessor)
        {
            waiter.watching = None;
        }
    }

    /// Claim the watch on `predecessor`. Returns `false` if one is already
    /// armed or the waiter is gone.
    fn claim_watch(&self, entry: &str, predecessor: &str) -> bool {
        let Some(mut waiter) = self.waiters.get_mut(entry) else {
            return false;
        };
        if waiter.watching.as_deref() == Some(predecessor) {
            return false;
        }
        waiter.watching = Some(predecessor.to_string());
        true
    }

    /// Delete an entry nobody waits on any more.
    ///
    /// An entry or session that is already gone counts as removed. Any other
    /// failure is returned and the entry is queued for background retry.
    pub(crate) async fn remove_entry(self: &Arc<Self>, entry: &str) -> StoreResult<()> {
        match self.store.delete(entry, None).await {
            Ok(()) | Err(StoreError::NoNode(_)) | Err(StoreError::SessionExpired) => Ok(()),
            Err(e) => {
                warn!(entry = %entry, error = %e, "Failed to remove queue entry, retrying");
                self.schedule_cleanup(entry);
                Err(e)
            }
        }
    }

    fn schedule_cleanup(self: &Arc<Self>, entry: &str) {
        if !self.cleanup.insert(entry.to_string()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let entry = entry.to_string();
        let period = self.settings.cleanup_retry();
        spawn_detached(async move {
            loop {
                sleep(period).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // Cleared when the session ends
                if !inner.cleanup.contains(&entry) {
                    break;
                }
                match inner.store.delete(&entry, None).await {
                    Ok(()) | Err(StoreError::NoNode(_)) | Err(StoreError::SessionExpired) => {
                        inner.cleanup.remove(&entry);
                        debug!(entry = %entry, "Abandoned queue entry removed");
                        break;
                    }
                    Err(e) => {
                        debug!(entry = %entry, error = %e, "Queue entry cleanup failed again");
                    }
                }
            }
        });
    }

    fn finish(&self, entry: &str, outcome: WaitOutcome) {
        if let Some((_, waiter)) = self.waiters.remove(entry) {
            metrics::gauge!(QUEUE_WAITERS).decrement(1.0);
            debug!(entry = %entry, outcome = ?outcome, "Queue wait completed");
            // The receiver may be gone if the caller was cancelled
            let _ = waiter.tx.send(outcome);
        }
    }

    pub(crate) async fn sorted_entries(&self, queue: &str) -> StoreResult<Vec<String>> {
        let children = self.store.children(queue).await?;
        Ok(sorted_entries(children, &self.settings.entry_prefix))
    }

    /// Recompute the position of `entry` in its queue from the live sibling
    /// list and act on it.
    pub(crate) async fn evaluate(self: &Arc<Self>, entry: &str) {
        loop {
            let Some(queue) = self.waiters.get(entry).map(|w| w.queue.clone()) else {
                return;
            };

            let entries = match self.sorted_entries(&queue).await {
                Ok(entries) => entries,
                Err(e) => {
                    self.finish(entry, WaitOutcome::Failed(e));
                    return;
                }
            };

            let own = entry_name(entry);
            let predecessor = match entries.iter().position(|e| e == own) {
                None => {
                    self.finish(entry, WaitOutcome::Vanished);
                    return;
                }
                Some(0) => {
                    self.finish(entry, WaitOutcome::Acquired);
                    return;
                }
                Some(idx) => format!("{}/{}", queue, entries[idx - 1]),
            };

            if !self.claim_watch(entry, &predecessor) {
                return;
            }
            let listener: Arc<dyn WatchListener> = Arc::new(PredecessorWatch {
                inner: Arc::downgrade(self),
                entry: entry.to_string(),
            });
            match self.store.watch_deletion(&predecessor, listener).await {
                Ok(true) => {
                    debug!(entry = %entry, predecessor = %predecessor, "Watching predecessor");
                    return;
                }
                // Predecessor went away between listing and arming; look again
                Ok(false) => {
                    self.unwatch(entry, &predecessor);
                    continue;
                }
                Err(e) => {
                    self.finish(entry, WaitOutcome::Failed(e));
                    return;
                }
            }
        }
    }

    /// Re-evaluate every parked waiter.
    pub(crate) async fn reconcile(self: &Arc<Self>) {
        let entries: Vec<String> = self.waiters.iter().map(|w| w.key().clone()).collect();
        if !entries.is_empty() {
            debug!(waiters = entries.len(), "Reconciling queue waiters");
        }
        for entry in entries {
            self.evaluate(&entry).await;
        }
    }

    /// The store session ended: every wait fails and every hold is gone.
    pub(crate) fn on_session_lost(&self) {
        let entries: Vec<String> = self.waiters.iter().map(|w| w.key().clone()).collect();
        for entry in &entries {
            self.finish(entry, WaitOutcome::SessionLost);
        }
        // Ephemeral entries went with the session
        self.cleanup.clear();

        let names: Vec<String> = self.held.iter().map(|h| h.key().clone()).collect();
        for name in names {
            if let Some((_, held)) = self.held.remove(&name) {
                warn!(
                    name = %name,
                    entry = %held.path,
                    token = %held.token,
                    "Queue lock lost with the store session"
                );
            }
        }
        warn!(
            failed_waiters = entries.len(),
            "Store session lost, pending queue waits failed"
        );
    }
}

/// Spawn `fut` on the current runtime, if there is one.
fn spawn_detached<F>(fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => warn!("No Tokio runtime to deliver queue notification"),
    }
}

/// One-shot deletion watch on a waiter's predecessor.
///
/// Holds the engine weakly so that watches still armed in the store do not
/// keep a dropped engine alive.
struct PredecessorWatch {
    inner: Weak<QueueInner>,
    entry: String,
}

impl WatchListener for PredecessorWatch {
    fn on_event(&self, event: WatchEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match event {
            WatchEvent::NodeDeleted(path) => {
                debug!(entry = %self.entry, deleted = %path, "Predecessor deleted");
                inner.unwatch(&self.entry, &path);
                let entry = self.entry.clone();
                spawn_detached(async move { inner.evaluate(&entry).await });
            }
            WatchEvent::SessionLost => inner.finish(&self.entry, WaitOutcome::SessionLost),
        }
    }
}

/// Session listener registered once per engine.
pub(crate) struct SessionWatch {
    pub(crate) inner: Weak<QueueInner>,
}

impl WatchListener for SessionWatch {
    fn on_event(&self, event: WatchEvent) {
        if event == WatchEvent::SessionLost
            && let Some(inner) = self.inner.upgrade()
        {
            inner.on_session_lost();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlock_store::MemoryTree;

    async fn setup(tree: &MemoryTree) -> Arc<QueueInner> {
        let session = tree.session();
        session.create_persistent("/q").await.unwrap();
        Arc::new(QueueInner::new(
            Arc::new(session),
            QueueSettings::default(),
        ))
    }

    async fn enqueue(inner: &Arc<QueueInner>) -> String {
        inner
            .store
            .create_ephemeral_sequential("/q/lock-", b"token")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_head_is_promoted() {
        let tree = MemoryTree::new();
        let inner = setup(&tree).await;
        let entry = enqueue(&inner).await;

        let rx = inner.register(&entry, "/q");
        inner.evaluate(&entry).await;
        assert_eq!(rx.await.unwrap(), WaitOutcome::Acquired);
        assert_eq!(inner.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_watches_predecessor() {
        let tree = MemoryTree::new();
        let inner = setup(&tree).await;
        let first = enqueue(&inner).await;
        let second = enqueue(&inner).await;

        let mut rx = inner.register(&second, "/q");
        inner.evaluate(&second).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(tree.watch_count(&first), 1);

        inner.store.delete(&first, None).await.unwrap();
        assert_eq!(rx.await.unwrap(), WaitOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_rearms_on_new_predecessor() {
        let tree = MemoryTree::new();
        let inner = setup(&tree).await;
        let first = enqueue(&inner).await;
        let middle = enqueue(&inner).await;
        let last = enqueue(&inner).await;

        let mut rx = inner.register(&last, "/q");
        inner.evaluate(&last).await;
        assert_eq!(tree.watch_count(&middle), 1);

        // The predecessor leaves early; the waiter must now watch the head
        inner.store.delete(&middle, None).await.unwrap();
        tokio::task::yield_now().await;
        for _ in 0..10 {
            if tree.watch_count(&first) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(tree.watch_count(&first), 1);
        assert!(rx.try_recv().is_err());

        inner.store.delete(&first, None).await.unwrap();
        assert_eq!(rx.await.unwrap(), WaitOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_repeated_evaluation_arms_one_watch() {
        let tree = MemoryTree::new();
        let inner = setup(&tree).await;
        let first = enqueue(&inner).await;
        let second = enqueue(&inner).await;

        let mut rx = inner.register(&second, "/q");
        for _ in 0..5 {
            inner.reconcile().await;
        }
        assert_eq!(tree.watch_count(&first), 1);
        assert!(rx.try_recv().is_err());

        inner.store.delete(&first, None).await.unwrap();
        assert_eq!(rx.await.unwrap(), WaitOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_failed_removal_is_retried() {
        let tree = MemoryTree::new();
        let session = tree.session();
        session.create_persistent("/q").await.unwrap();
        let inner = Arc::new(QueueInner::new(
            Arc::new(session.clone()),
            QueueSettings {
                cleanup_retry_ms: 10,
                ..Default::default()
            },
        ));
        let entry = enqueue(&inner).await;

        session.set_offline(true);
        let err = inner.remove_entry(&entry).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(inner.cleanup_count(), 1);
        // A second failure does not start another retry loop
        assert!(inner.remove_entry(&entry).await.is_err());
        assert_eq!(inner.cleanup_count(), 1);

        sleep(std::time::Duration::from_millis(50)).await;
        assert!(tree.exists(&entry));

        session.set_offline(false);
        for _ in 0..50 {
            if !tree.exists(&entry) {
                break;
            }
            sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!tree.exists(&entry));
        assert_eq!(inner.cleanup_count(), 0);
    }

    #[tokio::test]
    async fn test_session_loss_drops_pending_cleanup() {
        let tree = MemoryTree::new();
        let session = tree.session();
        session.create_persistent("/q").await.unwrap();
        let inner = Arc::new(QueueInner::new(
            Arc::new(session.clone()),
            QueueSettings::default(),
        ));
        let entry = enqueue(&inner).await;

        session.set_offline(true);
        assert!(inner.remove_entry(&entry).await.is_err());
        inner.on_session_lost();
        assert_eq!(inner.cleanup_count(), 0);
    }

    #[tokio::test]
    async fn test_vanished_entry() {
        let tree = MemoryTree::new();
        let inner = setup(&tree).await;
        let entry = enqueue(&inner).await;
        inner.store.delete(&entry, None).await.unwrap();

        let rx = inner.register(&entry, "/q");
        inner.evaluate(&entry).await;
        assert_eq!(rx.await.unwrap(), WaitOutcome::Vanished);
    }

    #[tokio::test]
    async fn test_finish_after_cancel_is_noop() {
        let tree = MemoryTree::new();
        let inner = setup(&tree).await;
        let entry = enqueue(&inner).await;

        let rx = inner.register(&entry, "/q");
        drop(rx);
        assert!(inner.deregister(&entry));
        assert!(!inner.deregister(&entry));
        inner.evaluate(&entry).await;
        inner.finish(&entry, WaitOutcome::Acquired);
        assert_eq!(inner.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_session_lost_fails_waiters() {
        let tree = MemoryTree::new();
        let inner = setup(&tree).await;
        let first = enqueue(&inner).await;
        let second = enqueue(&inner).await;
        inner.held.insert(
            "/q".to_string(),
            HeldEntry {
                path: first,
                token: OwnerToken::generate(),
            },
        );

        let rx = inner.register(&second, "/q");
        inner.evaluate(&second).await;

        inner.on_session_lost();
        assert_eq!(rx.await.unwrap(), WaitOutcome::SessionLost);
        assert!(inner.held.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_engine_ignores_watch() {
        let tree = MemoryTree::new();
        let inner = setup(&tree).await;
        let first = enqueue(&inner).await;
        let second = enqueue(&inner).await;

        let _rx = inner.register(&second, "/q");
        inner.evaluate(&second).await;
        let store = inner.store.clone();
        let weak = Arc::downgrade(&inner);
        drop(inner);
        assert!(weak.upgrade().is_none());

        // Fires into a dead weak reference
        store.delete(&first, None).await.unwrap();
    }
}
