//! Append-only, per-session log.
//!
//! Entries are stamped under the write lock so timestamps never go
//! backwards in append order. Readers copy a slice under the read lock,
//! so a page always reflects a single snapshot of the log.

use bgproc_core::{LogEntry, LogKind};
use chrono::Utc;
use std::sync::{PoisonError, RwLock};

/// Default page size for log reads.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// A page cut from a consistent snapshot of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSlice {
    pub entries: Vec<LogEntry>,
    /// Log length at the moment of the read.
    pub total: usize,
}

#[derive(Debug, Default)]
pub struct LogStore {
    entries: RwLock<Vec<LogEntry>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry stamped with the current time. Returns the new length.
    pub fn append(&self, kind: LogKind, content: impl Into<String>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let timestamp = match entries.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        entries.push(LogEntry {
            timestamp,
            kind,
            content: content.into(),
        });
        entries.len()
    }

    /// Read `[offset, offset + limit)` clipped to the current length.
    ///
    /// An offset past the end yields an empty slice; `total` is always exact.
    pub fn read(&self, offset: usize, limit: usize) -> LogSlice {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let total = entries.len();
        let start = offset.min(total);
        let end = start.saturating_add(limit).min(total);
        LogSlice {
            entries: entries[start..end].to_vec(),
            total,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
