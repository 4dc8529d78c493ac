//! Lock settings
//!
//! Loaded with the `config` crate from an optional file (YAML/TOML/JSON by
//! extension) overlaid with `DLOCK_`-prefixed environment variables, e.g.
//! `DLOCK_LEASE__TTL_MS=200`.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{LockError, LockResult};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "conf/dlock.yml";

/// Which engine serves a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Expiring-key lease with background renewal
    #[default]
    Lease,
    /// Fair queue of ephemeral sequential entries
    Queue,
    /// No-op backend for unimplemented stores
    Noop,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Lease => "lease",
            BackendKind::Queue => "queue",
            BackendKind::Noop => "noop",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lease" => Ok(BackendKind::Lease),
            "queue" => Ok(BackendKind::Queue),
            "noop" => Ok(BackendKind::Noop),
            other => Err(LockError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// Lease time-to-live
    pub ttl_ms: u64,
    /// Renewal period; must leave room for one missed tick inside the TTL
    pub renew_interval_ms: u64,
    /// Fixed backoff between acquisition attempts under contention
    pub retry_interval_ms: u64,
    /// Random extra backoff added to each retry, 0 to disable
    pub retry_jitter_ms: u64,
    /// Prepended to resource names to form the store key
    pub key_prefix: String,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 100,
            renew_interval_ms: 50,
            retry_interval_ms: 50,
            retry_jitter_ms: 0,
            key_prefix: String::new(),
        }
    }
}

impl LeaseSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> LockResult<()> {
        if self.renew_interval_ms == 0 {
            return Err(LockError::Config(
                "lease.renew_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.ttl_ms < self.renew_interval_ms.saturating_mul(2) {
            return Err(LockError::Config(format!(
                "lease.ttl_ms ({}) must be at least twice lease.renew_interval_ms ({})",
                self.ttl_ms, self.renew_interval_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Name prefix of the sequential entries under a queue node
    pub entry_prefix: String,
    /// Period of the waiter reconciliation sweep, 0 to disable
    pub reconcile_interval_ms: u64,
    /// Pause between attempts to delete an entry whose removal failed
    pub cleanup_retry_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            entry_prefix: "lock-".to_string(),
            reconcile_interval_ms: 0,
            cleanup_retry_ms: 100,
        }
    }
}

impl QueueSettings {
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_ms > 0).then(|| Duration::from_millis(self.reconcile_interval_ms))
    }

    pub fn cleanup_retry(&self) -> Duration {
        Duration::from_millis(self.cleanup_retry_ms)
    }

    pub fn validate(&self) -> LockResult<()> {
        if self.entry_prefix.is_empty() || self.entry_prefix.contains('/') {
            return Err(LockError::Config(format!(
                "queue.entry_prefix '{}' must be a non-empty single path segment",
                self.entry_prefix
            )));
        }
        if self.entry_prefix.ends_with(|c: char| c.is_ascii_digit()) {
            return Err(LockError::Config(format!(
                "queue.entry_prefix '{}' must not end with a digit",
                self.entry_prefix
            )));
        }
        if self.cleanup_retry_ms == 0 {
            return Err(LockError::Config(
                "queue.cleanup_retry_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Maps resource names starting with `prefix` to a backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSettings {
    pub prefix: String,
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZookeeperSettings {
    pub connect: String,
    pub session_timeout_ms: u64,
}

impl Default for ZookeeperSettings {
    fn default() -> Self {
        Self {
            connect: "127.0.0.1:2181".to_string(),
            session_timeout_ms: 2000,
        }
    }
}

impl ZookeeperSettings {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is not set
    pub level: String,
    /// Directory for the rolling log file; console only when unset
    pub dir: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub lease: LeaseSettings,
    pub queue: QueueSettings,
    pub default_backend: BackendKind,
    pub routes: Vec<RouteSettings>,
    pub redis: RedisSettings,
    pub zookeeper: ZookeeperSettings,
    pub logging: LoggingSettings,
}

impl LockSettings {
    /// Load from `path` (if it exists) and the environment, then validate.
    pub fn load(path: impl AsRef<Path>) -> LockResult<Self> {
        let settings: LockSettings = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("DLOCK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> LockResult<()> {
        self.lease.validate()?;
        self.queue.validate()?;
        for route in &self.routes {
            if route.prefix.is_empty() {
                return Err(LockError::Config(
                    "route prefix must not be empty; use default_backend instead".to_string(),
                ));
            }
        }
        Ok(())
    }
}
