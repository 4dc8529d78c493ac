//! Closed set of lock backends behind one [`DistributedLock`] implementation

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::LockResult;
use crate::lease::LeaseLock;
use crate::lock::DistributedLock;
use crate::queue::QueueLock;
use crate::settings::BackendKind;

pub enum LockBackend {
    Lease(LeaseLock),
    Queue(QueueLock),
    /// Stand-in for a store with no engine: never grants a contended lock
    Noop,
}

impl LockBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            LockBackend::Lease(_) => BackendKind::Lease,
            LockBackend::Queue(_) => BackendKind::Queue,
            LockBackend::Noop => BackendKind::Noop,
        }
    }
}

impl From<LeaseLock> for LockBackend {
    fn from(lock: LeaseLock) -> Self {
        LockBackend::Lease(lock)
    }
}

impl From<QueueLock> for LockBackend {
    fn from(lock: QueueLock) -> Self {
        LockBackend::Queue(lock)
    }
}

#[async_trait]
impl DistributedLock for LockBackend {
    async fn lock(&self, name: &str) -> LockResult<()> {
        match self {
            LockBackend::Lease(lock) => lock.lock(name).await,
            LockBackend::Queue(lock) => lock.lock(name).await,
            LockBackend::Noop => {
                debug!(name = %name, "Noop backend: lock");
                Ok(())
            }
        }
    }

    async fn try_lock(&self, name: &str, wait: Duration) -> LockResult<bool> {
        match self {
            LockBackend::Lease(lock) => lock.try_lock(name, wait).await,
            LockBackend::Queue(lock) => lock.try_lock(name, wait).await,
            LockBackend::Noop => Ok(false),
        }
    }

    async fn release(&self, name: &str) -> LockResult<bool> {
        match self {
            LockBackend::Lease(lock) => lock.release(name).await,
            LockBackend::Queue(lock) => lock.release(name).await,
            LockBackend::Noop => Ok(false),
        }
    }
}
