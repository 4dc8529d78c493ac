//! Distributed mutual exclusion over shared external stores
//!
//! Two engines implement [`DistributedLock`]:
//! - [`LeaseLock`]: an expiring key per resource, kept alive by a renewal task
//! - [`QueueLock`]: a fair FIFO queue of ephemeral sequential entries
//!
//! [`LockRouter`] selects an engine per resource name from [`LockSettings`].

pub mod backend;
pub mod error;
pub mod lease;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod router;
pub mod settings;
pub mod token;

pub use backend::LockBackend;
pub use error::{LockError, LockResult};
pub use lease::LeaseLock;
pub use lock::DistributedLock;
pub use queue::QueueLock;
pub use router::{LockRouter, LockRouterBuilder};
pub use settings::{
    BackendKind, DEFAULT_CONFIG_FILE, LeaseSettings, LockSettings, LoggingSettings,
    QueueSettings, RedisSettings, RouteSettings, ZookeeperSettings,
};
pub use token::OwnerToken;
