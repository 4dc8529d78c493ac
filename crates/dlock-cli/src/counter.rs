//! Shared-counter workload
//!
//! Each task repeatedly reads the counter, yields, and writes back the value
//! plus one. Without mutual exclusion the yields let tasks overwrite each
//! other's increments; with a working lock the final value is exact.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dlock_core::DistributedLock;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct CounterResult {
    pub total: u64,
    /// Releases that reported the lock was no longer held
    pub lost_releases: u64,
    pub elapsed: Duration,
}

async fn racy_increment(counter: &AtomicU64) {
    let value = counter.load(Ordering::SeqCst);
    tokio::task::yield_now().await;
    counter.store(value + 1, Ordering::SeqCst);
}

/// Run `tasks` tasks of `increments` unprotected increments each.
pub async fn run_unguarded(tasks: usize, increments: u64) -> anyhow::Result<CounterResult> {
    let started = Instant::now();
    let counter = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(tasks);
    for _ in 0..tasks {
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..increments {
                racy_increment(&counter).await;
            }
        }));
    }
    for handle in handles {
        handle.await?;
    }

    Ok(CounterResult {
        total: counter.load(Ordering::SeqCst),
        lost_releases: 0,
        elapsed: started.elapsed(),
    })
}

/// Run one task per lock handle, each doing `increments` increments while
/// holding `name`.
pub async fn run_guarded(
    locks: Vec<Arc<dyn DistributedLock>>,
    name: &str,
    increments: u64,
) -> anyhow::Result<CounterResult> {
    let started = Instant::now();
    let counter = Arc::new(AtomicU64::new(0));
    let lost_releases = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(locks.len());
    for (task, lock) in locks.into_iter().enumerate() {
        let counter = counter.clone();
        let lost_releases = lost_releases.clone();
        let name = name.to_string();
        handles.push(tokio::spawn(async move {
            for _ in 0..increments {
                lock.lock(&name).await?;
                racy_increment(&counter).await;
                if !lock.release(&name).await? {
                    lost_releases.fetch_add(1, Ordering::Relaxed);
                }
            }
            debug!(task, "Counter task finished");
            Ok::<_, anyhow::Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }

    Ok(CounterResult {
        total: counter.load(Ordering::SeqCst),
        lost_releases: lost_releases.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
    })
}
