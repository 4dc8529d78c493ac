//! Error types for lock operations
//!
//! Contention is not an error: a `try_lock` that runs out of budget and a
//! `release` by a non-owner both report `false`. Errors are reserved for the
//! store being unreachable and for protocol states the engine cannot recover
//! from on its own.

use dlock_store::StoreError;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The backing store failed or the coordination session ended
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The store is in a state the protocol does not allow, e.g. a queue entry
    /// disappeared without a deletion notification. The lock must be treated
    /// as lost and re-acquired.
    #[error("lock '{name}' lost: {reason}")]
    ProtocolInvariantViolated { name: String, reason: String },

    #[error("invalid lock name: '{0}'")]
    InvalidName(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A route or default refers to a backend whose store was not provided
    #[error("backend '{0}' is not available")]
    BackendMissing(String),
}

impl From<config::ConfigError> for LockError {
    fn from(err: config::ConfigError) -> Self {
        LockError::Config(err.to_string())
    }
}
