use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEFAULT_HISTORY_LINES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub offset: u64,
    pub line: String,
}

/// Per-source ring buffer of recently tailed lines.
pub struct LogHistory {
    max_lines: usize,
    logs: RwLock<HashMap<String, VecDeque<LogEntry>>>,
}

impl LogHistory {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Append an entry, evicting the oldest when over capacity.
    pub fn push(&self, source: &str, entry: LogEntry) {
        let mut logs = self.logs.write().unwrap_or_else(|p| p.into_inner());
        let entries = logs.entry(source.to_string()).or_default();
        entries.push_back(entry);
        while entries.len() > self.max_lines {
            entries.pop_front();
        }
    }

    /// Entries strictly newer than `since`, oldest first. `None` returns everything.
    pub fn fetch(&self, source: &str, since: Option<DateTime<Utc>>) -> Vec<LogEntry> {
        let logs = self.logs.read().unwrap_or_else(|p| p.into_inner());
        let Some(entries) = logs.get(source) else {
            return Vec::new();
        };
        let start = match since {
            Some(since) => entries.partition_point(|e| e.timestamp <= since),
            None => 0,
        };
        entries.range(start..).cloned().collect()
    }

    /// The last `n` entries.
    pub fn tail(&self, source: &str, n: usize) -> Vec<LogEntry> {
        let logs = self.logs.read().unwrap_or_else(|p| p.into_inner());
        let Some(entries) = logs.get(source) else {
            return Vec::new();
        };
        let start = entries.len().saturating_sub(n);
        entries.range(start..).cloned().collect()
    }

    pub fn clear(&self, source: &str) {
        let mut logs = self.logs.write().unwrap_or_else(|p| p.into_inner());
        logs.remove(source);
    }
}

impl Default for LogHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LINES)
    }
}
