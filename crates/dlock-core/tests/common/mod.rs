//! Shared helpers for lock integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dlock_core::{DistributedLock, LeaseLock, LeaseSettings, QueueLock, QueueSettings};
use dlock_store::{MemoryKeyStore, MemoryTree};

/// Lease settings with a short retry so contended tests finish quickly.
pub fn fast_lease_settings() -> LeaseSettings {
    LeaseSettings {
        retry_interval_ms: 2,
        retry_jitter_ms: 2,
        ..Default::default()
    }
}

/// One lease engine per simulated process, all sharing `store`.
pub fn lease_engine(store: &MemoryKeyStore) -> Arc<dyn DistributedLock> {
    Arc::new(LeaseLock::new(Arc::new(store.clone()), fast_lease_settings()).unwrap())
}

/// One queue engine per simulated process, each with its own session.
pub fn queue_engine(tree: &MemoryTree) -> Arc<dyn DistributedLock> {
    Arc::new(QueueLock::new(Arc::new(tree.session()), QueueSettings::default()).unwrap())
}

/// Result of a counter workload.
pub struct CounterRun {
    pub total: u64,
    pub max_concurrent_holders: usize,
}

/// Each engine increments a shared counter `increments` times with a
/// deliberate read-yield-write race, guarded by `name`.
pub async fn locked_counter(
    engines: Vec<Arc<dyn DistributedLock>>,
    name: &str,
    increments: u64,
) -> CounterRun {
    let counter = Arc::new(AtomicU64::new(0));
    let holders = Arc::new(AtomicUsize::new(0));
    let max_holders = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for lock in engines {
        let counter = counter.clone();
        let holders = holders.clone();
        let max_holders = max_holders.clone();
        let name = name.to_string();
        tasks.push(tokio::spawn(async move {
            for _ in 0..increments {
                lock.lock(&name).await.unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_holders.fetch_max(now, Ordering::SeqCst);

                let value = counter.load(Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.store(value + 1, Ordering::SeqCst);

                holders.fetch_sub(1, Ordering::SeqCst);
                assert!(lock.release(&name).await.unwrap());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    CounterRun {
        total: counter.load(Ordering::SeqCst),
        max_concurrent_holders: max_holders.load(Ordering::SeqCst),
    }
}

/// The same workload with no lock at all.
pub async fn unguarded_counter(tasks: usize, increments: u64) -> u64 {
    let counter = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for _ in 0..tasks {
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..increments {
                let value = counter.load(Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.store(value + 1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    counter.load(Ordering::SeqCst)
}
