//! ZooKeeper-backed hierarchical store.
//!
//! Wraps the async `zookeeper-client` crate. One `ZkStore` is one ZooKeeper
//! session: ephemeral nodes it creates vanish when the session expires, and
//! every watcher armed through it observes the session ending.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

use crate::error::{StoreError, StoreResult};
use crate::tree::{HierarchicalStore, NodeData, WatchEvent, WatchListener};

/// [`HierarchicalStore`] over a ZooKeeper session.
#[derive(Clone)]
pub struct ZkStore {
    client: zk::Client,
}

impl ZkStore {
    /// Connect to a ZooKeeper ensemble, e.g. `localhost:2181` or
    /// `zk1:2181,zk2:2181/chroot`.
    pub async fn connect(cluster: &str, session_timeout: Duration) -> StoreResult<Self> {
        let client = zk::Client::connector()
            .session_timeout(session_timeout)
            .connect(cluster)
            .await?;
        info!(cluster = %cluster, "Connected to ZooKeeper");
        Ok(Self { client })
    }

    pub fn client(&self) -> &zk::Client {
        &self.client
    }
}

fn with_path(err: zk::Error, path: &str) -> StoreError {
    match StoreError::from(err) {
        StoreError::NoNode(_) => StoreError::NoNode(path.to_string()),
        StoreError::NotEmpty(_) => StoreError::NotEmpty(path.to_string()),
        StoreError::BadVersion {
            expected, actual, ..
        } => StoreError::BadVersion {
            path: path.to_string(),
            expected,
            actual,
        },
        other => other,
    }
}

fn is_terminal(state: &zk::SessionState) -> bool {
    matches!(
        state,
        zk::SessionState::Expired | zk::SessionState::Closed | zk::SessionState::AuthFailed
    )
}

#[async_trait]
impl HierarchicalStore for ZkStore {
    async fn create_persistent(&self, path: &str) -> StoreResult<()> {
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        match self.client.create(path, &[], &options).await {
            Ok(_) | Err(zk::Error::NodeExists) => Ok(()),
            Err(e) => Err(with_path(e, path)),
        }
    }

    async fn create_ephemeral_sequential(&self, prefix: &str, value: &[u8]) -> StoreResult<String> {
        let options = zk::CreateMode::EphemeralSequential.with_acls(zk::Acls::anyone_all());
        let (_, sequence) = self
            .client
            .create(prefix, value, &options)
            .await
            .map_err(|e| with_path(e, prefix))?;
        Ok(format!("{}{}", prefix, sequence))
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.client
            .list_children(path)
            .await
            .map_err(|e| with_path(e, path))
    }

    async fn get(&self, path: &str) -> StoreResult<Option<NodeData>> {
        match self.client.get_data(path).await {
            Ok((value, stat)) => Ok(Some(NodeData {
                value,
                version: stat.version,
            })),
            Err(zk::Error::NoNode) => Ok(None),
            Err(e) => Err(with_path(e, path)),
        }
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> StoreResult<()> {
        self.client.delete(path, version).await.map_err(|e| match with_path(e, path) {
            StoreError::BadVersion { path, actual, .. } => StoreError::BadVersion {
                path,
                expected: version.unwrap_or(-1),
                actual,
            },
            other => other,
        })
    }

    async fn watch_deletion(
        &self,
        path: &str,
        listener: Arc<dyn WatchListener>,
    ) -> StoreResult<bool> {
        let (stat, watcher) = self
            .client
            .check_and_watch_stat(path)
            .await
            .map_err(|e| with_path(e, path))?;
        if stat.is_none() {
            // An existence watch was armed instead; dropping it is harmless
            return Ok(false);
        }

        let watched = path.to_string();
        tokio::spawn(async move {
            let event = watcher.changed().await;
            match event.event_type {
                zk::EventType::NodeDeleted => {
                    listener.on_event(WatchEvent::NodeDeleted(watched));
                }
                zk::EventType::Session => {
                    if is_terminal(&event.session_state) {
                        listener.on_event(WatchEvent::SessionLost);
                    }
                }
                other => {
                    // Data changes on a lock entry are not expected; the waiter
                    // re-evaluates on the next sweep or deletion
                    debug!(path = %watched, event = ?other, "Ignoring non-deletion watch event");
                }
            }
        });
        Ok(true)
    }

    fn subscribe_session(&self, listener: Arc<dyn WatchListener>) {
        let mut states = self.client.state_watcher();
        tokio::spawn(async move {
            loop {
                let state = states.changed().await;
                if is_terminal(&state) {
                    warn!(state = ?state, "ZooKeeper session ended");
                    listener.on_event(WatchEvent::SessionLost);
                    break;
                }
            }
        });
    }
}
