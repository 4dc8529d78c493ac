//! Hierarchical coordination store capability used by the queue backend
//!
//! Paths are absolute and `/`-separated (`/a/b/lock-0000000003`). Ephemeral
//! nodes belong to the session that created them and disappear when that
//! session ends. Deletion watches are one-shot: a listener fires at most once
//! per registration and must be re-armed by the caller.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreResult;

/// Value and version of a node as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub value: Vec<u8>,
    pub version: i32,
}

/// Notification delivered to a [`WatchListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watched node was deleted (explicitly or by session expiry)
    NodeDeleted(String),
    /// The session that registered the watch has ended
    SessionLost,
}

/// Receiver for store notifications.
///
/// Called on a store-owned context, never while the store holds an internal
/// lock. Implementations should hand real work off to a task and return.
pub trait WatchListener: Send + Sync + 'static {
    fn on_event(&self, event: WatchEvent);
}

/// A listener that invokes a closure.
pub struct FnWatchListener<F>
where
    F: Fn(WatchEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnWatchListener<F>
where
    F: Fn(WatchEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> WatchListener for FnWatchListener<F>
where
    F: Fn(WatchEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: WatchEvent) {
        (self.f)(event);
    }
}

/// Hierarchical store with ephemeral sequential nodes and deletion watches.
#[async_trait]
pub trait HierarchicalStore: Send + Sync {
    /// Create a persistent node. Succeeds if the node already exists.
    /// The parent must exist.
    async fn create_persistent(&self, path: &str) -> StoreResult<()>;

    /// Create an ephemeral node named `prefix` followed by a zero-padded,
    /// monotonically increasing sequence number. Returns the full path.
    async fn create_ephemeral_sequential(&self, prefix: &str, value: &[u8]) -> StoreResult<String>;

    /// Names (not paths) of the children of `path`, in no particular order.
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    async fn get(&self, path: &str) -> StoreResult<Option<NodeData>>;

    /// Delete a node, optionally only if it still has `version`.
    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()>;

    /// Arm a one-shot deletion watch on `path`.
    ///
    /// Returns `false` without arming anything if the node does not exist.
    async fn watch_deletion(&self, path: &str, listener: Arc<dyn WatchListener>)
    -> StoreResult<bool>;

    /// Register a listener that receives [`WatchEvent::SessionLost`] when the
    /// session backing this store handle ends.
    fn subscribe_session(&self, listener: Arc<dyn WatchListener>);
}

/// Parent of an absolute path, `/` for top-level nodes.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}
