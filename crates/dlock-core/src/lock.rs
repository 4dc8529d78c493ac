//! The lock capability shared by every backend

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockResult;

/// Distributed mutual exclusion over a named resource.
///
/// Not reentrant: a second `lock` of a name this process already holds waits
/// like any other contender.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Wait until the lock on `name` is held.
    ///
    /// Only store failures end the wait early; contention never does.
    async fn lock(&self, name: &str) -> LockResult<()>;

    /// Try to acquire `name` within `wait`.
    ///
    /// Returns `Ok(false)` once the budget is spent. A zero budget makes a
    /// single attempt and never waits.
    async fn try_lock(&self, name: &str, wait: Duration) -> LockResult<bool>;

    /// Release `name` if this process holds it.
    ///
    /// Returns `Ok(false)` when it was never held or has already been lost.
    async fn release(&self, name: &str) -> LockResult<bool>;
}
