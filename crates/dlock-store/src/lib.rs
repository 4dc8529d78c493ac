//! dlock Store - adapters for the external services behind each lock backend
//!
//! This crate provides:
//! - `ExpiringKeyStore`: key-value store with per-key expiry (lease backend)
//! - `HierarchicalStore`: tree of persistent and ephemeral-sequential nodes
//!   with one-shot deletion watches (queue backend)
//! - In-memory implementations of both, used by tests and the demo binary
//! - Redis adapter (feature `redis-backend`)
//! - ZooKeeper adapter (feature `zookeeper-backend`)

pub mod error;
pub mod key;
pub mod memory;
pub mod tree;

#[cfg(feature = "redis-backend")]
pub mod redis;

#[cfg(feature = "zookeeper-backend")]
pub mod zookeeper;

pub use error::{StoreError, StoreResult};
pub use key::ExpiringKeyStore;
pub use memory::{MemoryKeyStore, MemorySession, MemoryTree};
pub use tree::{
    FnWatchListener, HierarchicalStore, NodeData, WatchEvent, WatchListener, parent_path,
};

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisKeyStore;

#[cfg(feature = "zookeeper-backend")]
pub use self::zookeeper::ZkStore;
