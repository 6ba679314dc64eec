//! Bounded log ring for driver-server output
//!
//! A fixed-capacity FIFO of post-filter log entries. Appends that duplicate
//! the most recent retained message are skipped; when full, the oldest entry
//! is evicted.

use crate::{LogEntry, LogLevel};
use std::collections::VecDeque;
use std::sync::RwLock;

/// Bounded FIFO of log entries with newest-entry dedup
#[derive(Debug)]
pub struct LogRing {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// Append an entry unless it repeats the most recent retained message.
    /// Returns true when the entry was retained.
    pub fn push(&self, entry: LogEntry) -> bool {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(last) = entries.back() {
            if last.message == entry.message {
                return false;
            }
        }
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        true
    }

    /// Convenience append for a plain message line
    pub fn push_line(&self, device_id: &str, level: LogLevel, tag: &str, message: String) -> bool {
        self.push(LogEntry::new(device_id, level, tag, message))
    }

    /// Snapshot copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<LogEntry> {
        match self.entries.read() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn clear(&self) {
        match self.entries.write() {
            Ok(mut entries) => entries.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
