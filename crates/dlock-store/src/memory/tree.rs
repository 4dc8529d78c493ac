//! In-memory hierarchical store with sessions
//!
//! `MemoryTree` is the shared "server"; each `MemorySession` is one client
//! connection to it. Ephemeral nodes are owned by the session that created
//! them and are removed, with the usual deletion notifications, when that
//! session expires.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::tree::{HierarchicalStore, NodeData, WatchEvent, WatchListener, parent_path};

struct Node {
    value: Vec<u8>,
    version: i32,
    ephemeral_owner: Option<u64>,
    /// Next sequence number handed to a sequential child
    child_sequence: u64,
}

impl Node {
    fn new(value: Vec<u8>, ephemeral_owner: Option<u64>) -> Self {
        Self {
            value,
            version: 0,
            ephemeral_owner,
            child_sequence: 0,
        }
    }
}

struct Watch {
    session: u64,
    listener: Arc<dyn WatchListener>,
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    deletion_watches: HashMap<String, Vec<Watch>>,
    session_listeners: HashMap<u64, Vec<Arc<dyn WatchListener>>>,
    live_sessions: HashSet<u64>,
}

type Notification = (Arc<dyn WatchListener>, WatchEvent);

impl TreeState {
    fn has_children(&self, path: &str) -> bool {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    /// Remove a node and collect the deletion notifications it triggers.
    fn remove_node(&mut self, path: &str, out: &mut Vec<Notification>) {
        if self.nodes.remove(path).is_some()
            && let Some(watches) = self.deletion_watches.remove(path)
        {
            for watch in watches {
                out.push((watch.listener, WatchEvent::NodeDeleted(path.to_string())));
            }
        }
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn validate_path(path: &str) -> StoreResult<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn fire(notifications: Vec<Notification>) {
    for (listener, event) in notifications {
        listener.on_event(event);
    }
}

/// Shared in-memory tree. Hand out one [`MemorySession`] per simulated client.
#[derive(Clone, Default)]
pub struct MemoryTree {
    state: Arc<Mutex<TreeState>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client session.
    pub fn session(&self) -> MemorySession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.lock().live_sessions.insert(id);
        debug!(session = id, "Memory tree session opened");
        MemorySession {
            tree: self.clone(),
            id,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a node exists, regardless of session.
    pub fn exists(&self, path: &str) -> bool {
        path == "/" || self.state.lock().nodes.contains_key(path)
    }

    /// Number of deletion watches currently armed on `path`.
    pub fn watch_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .deletion_watches
            .get(path)
            .map_or(0, |w| w.len())
    }

    /// Drop every deletion watch armed on `path` without firing it, as if
    /// the notifications were lost in transit.
    pub fn clear_watches(&self, path: &str) -> usize {
        self.state
            .lock()
            .deletion_watches
            .remove(path)
            .map_or(0, |w| w.len())
    }
}

/// One client session against a [`MemoryTree`].
#[derive(Clone)]
pub struct MemorySession {
    tree: MemoryTree,
    id: u64,
    offline: Arc<AtomicBool>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulate a connection loss that the session survives: while offline
    /// every call fails with [`StoreError::Connection`], but ephemeral nodes
    /// and armed watches stay in place.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.tree.state.lock().live_sessions.contains(&self.id)
    }

    /// End the session as if the client crashed or was partitioned past its
    /// session timeout.
    ///
    /// All ephemeral nodes owned by the session are deleted (their deletion
    /// watches fire), then this session's watches and session listeners
    /// receive [`WatchEvent::SessionLost`].
    pub fn expire(&self) {
        let mut notifications = Vec::new();
        {
            let mut state = self.tree.state.lock();
            if !state.live_sessions.remove(&self.id) {
                return;
            }

            // Watches and listeners registered by this session die with it
            let mut lost = Vec::new();
            for watches in state.deletion_watches.values_mut() {
                let (mine, others): (Vec<Watch>, Vec<Watch>) =
                    watches.drain(..).partition(|w| w.session == self.id);
                *watches = others;
                lost.extend(mine.into_iter().map(|w| w.listener));
            }
            state.deletion_watches.retain(|_, w| !w.is_empty());
            lost.extend(
                state
                    .session_listeners
                    .remove(&self.id)
                    .unwrap_or_default(),
            );

            let owned: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, n)| n.ephemeral_owner == Some(self.id))
                .map(|(k, _)| k.clone())
                .collect();
            for path in &owned {
                state.remove_node(path, &mut notifications);
            }
            notifications.extend(lost.into_iter().map(|l| (l, WatchEvent::SessionLost)));

            debug!(
                session = self.id,
                ephemeral_nodes = owned.len(),
                "Memory tree session expired"
            );
        }
        fire(notifications);
    }

    fn check_alive(&self, state: &TreeState) -> StoreResult<()> {
        if !state.live_sessions.contains(&self.id) {
            return Err(StoreError::SessionExpired);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory session is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl HierarchicalStore for MemorySession {
    async fn create_persistent(&self, path: &str) -> StoreResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Ok(());
        }
        let mut state = self.tree.state.lock();
        self.check_alive(&state)?;
        if state.nodes.contains_key(path) {
            return Ok(());
        }
        let parent = parent_path(path);
        if parent != "/" && !state.nodes.contains_key(parent) {
            return Err(StoreError::NoNode(parent.to_string()));
        }
        state.nodes.insert(path.to_string(), Node::new(Vec::new(), None));
        Ok(())
    }

    async fn create_ephemeral_sequential(&self, prefix: &str, value: &[u8]) -> StoreResult<String> {
        validate_path(prefix)?;
        let mut state = self.tree.state.lock();
        self.check_alive(&state)?;
        let parent = parent_path(prefix).to_string();

        // The root behaves like any other parent but is never stored
        let sequence = if parent == "/" {
            let root = state
                .nodes
                .entry("/".to_string())
                .or_insert_with(|| Node::new(Vec::new(), None));
            let seq = root.child_sequence;
            root.child_sequence += 1;
            seq
        } else {
            let node = state
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| StoreError::NoNode(parent.clone()))?;
            if node.ephemeral_owner.is_some() {
                return Err(StoreError::Backend(format!(
                    "ephemeral node {} cannot have children",
                    parent
                )));
            }
            let seq = node.child_sequence;
            node.child_sequence += 1;
            seq
        };

        let path = format!("{}{:010}", prefix, sequence);
        state
            .nodes
            .insert(path.clone(), Node::new(value.to_vec(), Some(self.id)));
        Ok(path)
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        validate_path(path)?;
        let state = self.tree.state.lock();
        self.check_alive(&state)?;
        if path != "/" && !state.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let prefix = child_prefix(path);
        Ok(state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    async fn get(&self, path: &str) -> StoreResult<Option<NodeData>> {
        validate_path(path)?;
        let state = self.tree.state.lock();
        self.check_alive(&state)?;
        Ok(state.nodes.get(path).map(|n| NodeData {
            value: n.value.clone(),
            version: n.version,
        }))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()> {
        validate_path(path)?;
        let mut notifications = Vec::new();
        {
            let mut state = self.tree.state.lock();
            self.check_alive(&state)?;
            let node = state
                .nodes
                .get(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            if let Some(expected) = version
                && node.version != expected
            {
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
            if state.has_children(path) {
                return Err(StoreError::NotEmpty(path.to_string()));
            }
            state.remove_node(path, &mut notifications);
        }
        fire(notifications);
        Ok(())
    }

    async fn watch_deletion(
        &self,
        path: &str,
        listener: Arc<dyn WatchListener>,
    ) -> StoreResult<bool> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        self.check_alive(&state)?;
        if !state.nodes.contains_key(path) {
            return Ok(false);
        }
        state
            .deletion_watches
            .entry(path.to_string())
            .or_default()
            .push(Watch {
                session: self.id,
                listener,
            });
        Ok(true)
    }

    fn subscribe_session(&self, listener: Arc<dyn WatchListener>) {
        let alive = {
            let mut state = self.tree.state.lock();
            let alive = state.live_sessions.contains(&self.id);
            if alive {
                state
                    .session_listeners
                    .entry(self.id)
                    .or_default()
                    .push(listener.clone());
            }
            alive
        };
        if !alive {
            listener.on_event(WatchEvent::SessionLost);
        }
    }
}
