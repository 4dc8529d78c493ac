//! Lock facade: picks a backend per resource name
//!
//! Routes are matched by longest prefix; names no route matches go to the
//! default backend. The router forwards calls unchanged and never retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dlock_store::{ExpiringKeyStore, HierarchicalStore};
use tracing::info;

use crate::backend::LockBackend;
use crate::error::{LockError, LockResult};
use crate::lease::LeaseLock;
use crate::lock::DistributedLock;
use crate::queue::QueueLock;
use crate::settings::{BackendKind, LockSettings};

pub struct LockRouter {
    /// Sorted by descending prefix length
    routes: Vec<(String, Arc<LockBackend>)>,
    default: Arc<LockBackend>,
}

impl LockRouter {
    pub fn builder() -> LockRouterBuilder {
        LockRouterBuilder::default()
    }

    /// Build engines for every backend the settings refer to.
    ///
    /// Each engine is created once and shared by all routes that name it.
    /// Fails with [`LockError::BackendMissing`] if a lease or queue backend is
    /// referenced but its store was not supplied.
    pub fn from_settings(
        settings: &LockSettings,
        key_store: Option<Arc<dyn ExpiringKeyStore>>,
        tree_store: Option<Arc<dyn HierarchicalStore>>,
    ) -> LockResult<Self> {
        settings.validate()?;

        let mut lease: Option<Arc<LockBackend>> = None;
        let mut queue: Option<Arc<LockBackend>> = None;
        let noop = Arc::new(LockBackend::Noop);

        let mut resolve = |kind: BackendKind| -> LockResult<Arc<LockBackend>> {
            match kind {
                BackendKind::Lease => {
                    if let Some(backend) = &lease {
                        return Ok(backend.clone());
                    }
                    let store = key_store
                        .clone()
                        .ok_or_else(|| LockError::BackendMissing(kind.as_str().to_string()))?;
                    let backend = Arc::new(LockBackend::Lease(LeaseLock::new(
                        store,
                        settings.lease.clone(),
                    )?));
                    lease = Some(backend.clone());
                    Ok(backend)
                }
                BackendKind::Queue => {
                    if let Some(backend) = &queue {
                        return Ok(backend.clone());
                    }
                    let store = tree_store
                        .clone()
                        .ok_or_else(|| LockError::BackendMissing(kind.as_str().to_string()))?;
                    let backend = Arc::new(LockBackend::Queue(QueueLock::new(
                        store,
                        settings.queue.clone(),
                    )?));
                    queue = Some(backend.clone());
                    Ok(backend)
                }
                BackendKind::Noop => Ok(noop.clone()),
            }
        };

        let mut builder = LockRouter::builder().default_backend(resolve(settings.default_backend)?);
        for route in &settings.routes {
            builder = builder.route(&route.prefix, resolve(route.backend)?);
        }
        let router = builder.build();
        info!(
            default_backend = settings.default_backend.as_str(),
            routes = settings.routes.len(),
            "Lock router initialized"
        );
        Ok(router)
    }

    /// The backend serving `name`.
    pub fn backend_for(&self, name: &str) -> &Arc<LockBackend> {
        self.routes
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, backend)| backend)
            .unwrap_or(&self.default)
    }
}

#[async_trait]
impl DistributedLock for LockRouter {
    async fn lock(&self, name: &str) -> LockResult<()> {
        self.backend_for(name).lock(name).await
    }

    async fn try_lock(&self, name: &str, wait: Duration) -> LockResult<bool> {
        self.backend_for(name).try_lock(name, wait).await
    }

    async fn release(&self, name: &str) -> LockResult<bool> {
        self.backend_for(name).release(name).await
    }
}

pub struct LockRouterBuilder {
    routes: Vec<(String, Arc<LockBackend>)>,
    default: Arc<LockBackend>,
}

impl Default for LockRouterBuilder {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            default: Arc::new(LockBackend::Noop),
        }
    }
}

impl LockRouterBuilder {
    /// Serve names starting with `prefix` from `backend`. A later route with
    /// the same prefix replaces the earlier one.
    pub fn route(mut self, prefix: &str, backend: Arc<LockBackend>) -> Self {
        self.routes.retain(|(p, _)| p != prefix);
        self.routes.push((prefix.to_string(), backend));
        self
    }

    /// Backend for names no route matches. Defaults to [`LockBackend::Noop`].
    pub fn default_backend(mut self, backend: Arc<LockBackend>) -> Self {
        self.default = backend;
        self
    }

    pub fn build(mut self) -> LockRouter {
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        LockRouter {
            routes: self.routes,
            default: self.default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RouteSettings;
    use dlock_store::{MemoryKeyStore, MemoryTree};

    fn settings(default_backend: BackendKind, routes: &[(&str, BackendKind)]) -> LockSettings {
        LockSettings {
            default_backend,
            routes: routes
                .iter()
                .map(|(prefix, backend)| RouteSettings {
                    prefix: prefix.to_string(),
                    backend: *backend,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let tree = MemoryTree::new();
        let router = LockRouter::from_settings(
            &settings(
                BackendKind::Noop,
                &[
                    ("/jobs", BackendKind::Lease),
                    ("/jobs/fair", BackendKind::Queue),
                ],
            ),
            Some(Arc::new(MemoryKeyStore::new())),
            Some(Arc::new(tree.session())),
        )
        .unwrap();

        assert_eq!(router.backend_for("/jobs/a").kind(), BackendKind::Lease);
        assert_eq!(router.backend_for("/jobs/fair/a").kind(), BackendKind::Queue);
        assert_eq!(router.backend_for("/other").kind(), BackendKind::Noop);
    }

    #[tokio::test]
    async fn test_routes_share_one_engine() {
        let router = LockRouter::from_settings(
            &settings(BackendKind::Lease, &[("/a", BackendKind::Lease)]),
            Some(Arc::new(MemoryKeyStore::new())),
            None,
        )
        .unwrap();
        assert!(Arc::ptr_eq(
            router.backend_for("/a/x"),
            router.backend_for("/b/x")
        ));
    }

    #[tokio::test]
    async fn test_missing_store() {
        let result = LockRouter::from_settings(
            &settings(BackendKind::Lease, &[("/q", BackendKind::Queue)]),
            Some(Arc::new(MemoryKeyStore::new())),
            None,
        );
        assert!(matches!(result, Err(LockError::BackendMissing(b)) if b == "queue"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_to_selected_engine() {
        let keys = MemoryKeyStore::new();
        let tree = MemoryTree::new();
        let router = LockRouter::from_settings(
            &settings(BackendKind::Lease, &[("/fair", BackendKind::Queue)]),
            Some(Arc::new(keys.clone())),
            Some(Arc::new(tree.session())),
        )
        .unwrap();

        router.lock("/fair/orders").await.unwrap();
        assert!(tree.exists("/fair/orders/lock-0000000000"));
        assert_eq!(keys.get("/fair/orders").await.unwrap(), None);

        router.lock("/plain").await.unwrap();
        assert!(keys.get("/plain").await.unwrap().is_some());

        assert!(router.release("/fair/orders").await.unwrap());
        assert!(router.release("/plain").await.unwrap());
    }

    #[tokio::test]
    async fn test_builder_default_is_noop() {
        let router = LockRouter::builder().build();
        assert!(!router.try_lock("x", Duration::ZERO).await.unwrap());
    }
}
