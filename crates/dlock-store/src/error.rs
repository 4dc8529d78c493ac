//! Error types for store adapter operations

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a store adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("connection error: {0}")]
    Connection(String),

    /// The coordination session ended; ephemeral nodes and watches are gone
    #[error("session expired")]
    SessionExpired,

    #[error("node not found: {0}")]
    NoNode(String),

    /// Conditional delete/update saw a different version
    #[error("version mismatch on {path}: expected {expected}, got {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this error means the store itself is unreachable, as opposed to
    /// a conditional operation losing a race.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::SessionExpired)
    }
}

#[cfg(feature = "redis-backend")]
impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Backend(format!("Redis error: {}", err))
        }
    }
}

#[cfg(feature = "zookeeper-backend")]
impl From<zookeeper_client::Error> for StoreError {
    fn from(err: zookeeper_client::Error) -> Self {
        use zookeeper_client::Error;
        match err {
            Error::NoNode => StoreError::NoNode(String::new()),
            Error::NotEmpty => StoreError::NotEmpty(String::new()),
            Error::BadVersion => StoreError::BadVersion {
                path: String::new(),
                expected: -1,
                actual: -1,
            },
            Error::SessionExpired | Error::ClientClosed => StoreError::SessionExpired,
            Error::ConnectionLoss => StoreError::Connection("connection loss".to_string()),
            other => StoreError::Backend(format!("ZooKeeper error: {}", other)),
        }
    }
}
