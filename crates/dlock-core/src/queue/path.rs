// Queue node layout for a resource name
//
//   name "/orders/eu"  ->  /orders (persistent)
//                          /orders/eu (persistent, the queue)
//                          /orders/eu/lock-0000000007 (ephemeral sequential entry)

use crate::error::{LockError, LockResult};

/// Width of the zero-padded counter the store appends to sequential nodes.
const SEQUENCE_DIGITS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuePath {
    segments: Vec<String>,
    queue: String,
}

impl QueuePath {
    /// Split a resource name on `/`, dropping empty segments.
    ///
    /// A segment shaped like a queue entry would sit among the entries of the
    /// queue above it, so such names are rejected.
    pub(crate) fn parse(name: &str, entry_prefix: &str) -> LockResult<Self> {
        let segments: Vec<String> = name
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let entry_shaped = segments
            .iter()
            .any(|s| sequence_in(s, entry_prefix).is_some());
        if segments.is_empty() || entry_shaped {
            return Err(LockError::InvalidName(name.to_string()));
        }
        let queue = format!("/{}", segments.join("/"));
        Ok(Self { segments, queue })
    }

    /// Path of the node whose children form the queue.
    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    /// Every persistent node from the top down to the queue itself.
    pub(crate) fn ancestors(&self) -> Vec<String> {
        (1..=self.segments.len())
            .map(|n| format!("/{}", self.segments[..n].join("/")))
            .collect()
    }

    /// Prefix handed to the store when creating a sequential entry.
    pub(crate) fn entry_prefix(&self, prefix: &str) -> String {
        format!("{}/{}", self.queue, prefix)
    }

    pub(crate) fn entry_path(&self, child: &str) -> String {
        format!("{}/{}", self.queue, child)
    }
}

/// Last segment of an entry path.
pub(crate) fn entry_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Sequence number of `name` if it is exactly `prefix` followed by a
/// store-generated counter.
fn sequence_in(name: &str, prefix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.len() < SEQUENCE_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Queue entries among `children`, in acquisition order.
///
/// Children that are not entries (nested queues for longer names) are skipped.
pub(crate) fn sorted_entries(children: Vec<String>, prefix: &str) -> Vec<String> {
    let mut entries: Vec<(u64, String)> = children
        .into_iter()
        .filter_map(|c| sequence_in(&c, prefix).map(|seq| (seq, c)))
        .collect();
    entries.sort();
    entries.into_iter().map(|(_, name)| name).collect()
}
