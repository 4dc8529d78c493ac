//! In-memory store implementations
//!
//! Single-process stand-ins for Redis and ZooKeeper. They honor the same
//! atomicity, expiry, and session semantics as the real services so the lock
//! engines can be exercised without external infrastructure.

mod key;
mod tree;

pub use key::MemoryKeyStore;
pub use tree::{MemorySession, MemoryTree};
