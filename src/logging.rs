//! Application log feed
//!
//! This module provides the bounded log buffer that backs the UI log view.
//! Subprocess output lines and orchestration warnings are appended here
//! with a capture timestamp; the frontend reads them back filtered by
//! level, subscribes to the live feed, or exports them as text.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default maximum number of retained log entries
const DEFAULT_CAPACITY: usize = 1000;

/// Capacity of the live log-feed broadcast channel
const FEED_CAPACITY: usize = 256;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Get a human-readable string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse a log level from its string representation
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// A single timestamped log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Bounded in-memory log buffer with a live broadcast feed
///
/// Oldest entries are evicted once the capacity is reached. Every appended
/// entry is also published to subscribers; a lagging subscriber misses
/// entries rather than blocking the writer.
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    feed: broadcast::Sender<LogEntry>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            feed,
        }
    }

    /// Append an entry, evicting the oldest one if the buffer is full
    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        {
            let mut entries = self.entries.lock().unwrap();
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        let _ = self.feed.send(entry);
    }

    /// Subscribe to the live log feed
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.feed.subscribe()
    }

    /// Get all entries at or above the given level, oldest first
    pub fn get_filtered(&self, min_level: LogLevel) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level >= min_level)
            .cloned()
            .collect()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render all entries as plain text for export
    pub fn export_as_text(&self) -> String {
        let entries = self.entries.lock().unwrap();
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(&format!(
                "[{}] [{}] {}\n",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                entry.level.as_str(),
                entry.message
            ));
        }
        out
    }
}

/// Current minimum level used when reading the buffer back for display
pub struct LogFilterState {
    level: Mutex<LogLevel>,
}

impl Default for LogFilterState {
    fn default() -> Self {
        Self {
            level: Mutex::new(LogLevel::Debug),
        }
    }
}

impl LogFilterState {
    pub fn get_level(&self) -> LogLevel {
        *self.level.lock().unwrap()
    }

    pub fn set_level(&self, level: LogLevel) {
        *self.level.lock().unwrap() = level;
    }
}
