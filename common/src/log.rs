use std::collections::VecDeque;
use std::fmt::Display;

use chrono::{DateTime, TimeZone};

use crate::types::{LogEntry, LogSource};

/// Append-only, capacity-bounded event log. Oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Rebuilds a buffer from persisted entries, keeping only the newest
    /// `capacity` of them.
    pub fn from_entries(capacity: usize, entries: Vec<LogEntry>) -> Self {
        let mut buffer = Self::new(capacity);
        for entry in entries {
            buffer.push_entry(entry);
        }
        buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_id(&self) -> Option<i64> {
        self.entries.back().map(|entry| entry.id)
    }

    /// Appends a new entry. The id is the append time in epoch milliseconds,
    /// bumped past the previous id when several appends share a millisecond.
    pub fn append(
        &mut self,
        source: LogSource,
        msg: impl Into<String>,
        time: impl Into<String>,
        now_ms: i64,
    ) -> LogEntry {
        let id = match self.last_id() {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };

        let entry = LogEntry {
            time: time.into(),
            source,
            msg: msg.into(),
            id,
        };
        self.push_entry(entry.clone());
        entry
    }

    /// The newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    fn push_entry(&mut self, entry: LogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

/// Formats an append time as a 24-hour wall clock in the given zone.
pub fn format_log_time<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.format("%H:%M:%S").to_string()
}
