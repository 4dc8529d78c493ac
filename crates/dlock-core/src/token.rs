//! Owner tokens
//!
//! A token identifies one acquisition. It is written into the lease value or
//! the queue entry and compared on renewal and release, so it must be unique
//! across threads, processes, and hosts: `host:pid:uuid`.

use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerToken(String);

fn process_prefix() -> &'static str {
    static PREFIX: OnceLock<String> = OnceLock::new();
    PREFIX.get_or_init(|| {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        format!("{}:{}", host, std::process::id())
    })
}

impl OwnerToken {
    /// Generate a fresh token for a new acquisition.
    pub fn generate() -> Self {
        Self(format!("{}:{}", process_prefix(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Whether a stored value was written by this token.
    pub fn matches(&self, stored: &[u8]) -> bool {
        self.0.as_bytes() == stored
    }
}

impl Display for OwnerToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}
