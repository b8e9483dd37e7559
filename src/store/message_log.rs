//! Bounded newest-first log of MQTT traffic

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Capacity used when none (or zero) is configured
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    #[serde(rename = "Send")]
    Sent,
    #[serde(rename = "Recv")]
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => f.write_str("Send"),
            Direction::Received => f.write_str("Recv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub direction: Direction,
    pub topic: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// Fixed-capacity message log. The head is the newest entry; once full,
/// every append evicts the oldest one.
#[derive(Debug)]
pub struct MessageLog {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a message and return the stored entry
    pub fn append(&self, direction: Direction, topic: &str, payload: &str) -> LogEntry {
        let entry = LogEntry {
            direction,
            topic: topic.to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now(),
        };

        let mut entries = self.entries.write();
        entries.push_front(entry.clone());
        entries.truncate(self.capacity);
        entry
    }

    /// Snapshot of every entry, newest first
    pub fn all(&self) -> Vec<LogEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// The `n` newest entries; `0` or more than stored returns everything
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.read();
        let n = if n == 0 { entries.len() } else { n.min(entries.len()) };
        entries.iter().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
