//! FIFO admission order of the queue backend

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::queue_engine;
use dlock_core::DistributedLock;
use dlock_store::MemoryTree;
use tokio::sync::{Mutex, mpsc};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_acquire_in_registration_order() {
    let tree = MemoryTree::new();
    let holder = queue_engine(&tree);
    holder.lock("/fifo").await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for i in 0..10 {
        let lock = queue_engine(&tree);
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            lock.lock("/fifo").await.unwrap();
            order.lock().await.push(i);
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert!(lock.release("/fifo").await.unwrap());
        }));

        // Wait until this waiter's entry is in the queue before adding the next
        let entry = format!("/fifo/lock-{:010}", i + 1);
        while !tree.exists(&entry) {
            tokio::task::yield_now().await;
        }
    }

    assert!(holder.release("/fifo").await.unwrap());
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*order.lock().await, (0..10).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_waiter_is_skipped() {
    let tree = MemoryTree::new();
    let holder = queue_engine(&tree);
    let impatient = queue_engine(&tree);
    let patient = queue_engine(&tree);
    holder.lock("/fifo").await.unwrap();

    let (tx, mut rx) = mpsc::channel(1);
    let quitter = tokio::spawn(async move {
        let acquired = impatient
            .try_lock("/fifo", Duration::from_millis(50))
            .await
            .unwrap();
        tx.send(()).await.unwrap();
        acquired
    });
    while !tree.exists("/fifo/lock-0000000001") {
        tokio::task::yield_now().await;
    }

    let waiter = tokio::spawn(async move {
        patient.lock("/fifo").await.unwrap();
        patient.release("/fifo").await.unwrap()
    });
    while !tree.exists("/fifo/lock-0000000002") {
        tokio::task::yield_now().await;
    }

    // The impatient waiter gives up while the lock is still held
    rx.recv().await.unwrap();
    assert!(!quitter.await.unwrap());
    assert!(!tree.exists("/fifo/lock-0000000001"));

    assert!(holder.release("/fifo").await.unwrap());
    assert!(waiter.await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crash_and_release_share_one_path() {
    let tree = MemoryTree::new();
    let crashed_session = tree.session();
    let crashed = dlock_core::QueueLock::new(
        Arc::new(crashed_session.clone()),
        dlock_core::QueueSettings::default(),
    )
    .unwrap();
    crashed.lock("/fifo").await.unwrap();

    let next = queue_engine(&tree);
    let task = tokio::spawn(async move {
        next.lock("/fifo").await.unwrap();
        next.release("/fifo").await.unwrap()
    });
    while !tree.exists("/fifo/lock-0000000001") {
        tokio::task::yield_now().await;
    }

    crashed_session.expire();
    assert!(task.await.unwrap());
}
