//! Per-session collaborator error bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const RECENT_ERRORS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    /// Operation that failed, e.g. `place_call`
    pub operation: String,
    pub message: String,
}

/// Error count, last error and a ring buffer of the most recent ones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    count: u64,
    recent: VecDeque<ErrorEntry>,
}

impl ErrorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, operation: &str, message: impl Into<String>) {
        self.count += 1;
        if self.recent.len() == RECENT_ERRORS {
            self.recent.pop_front();
        }
        self.recent.push_back(ErrorEntry {
            at: Utc::now(),
            operation: operation.to_string(),
            message: message.into(),
        });
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn last_error(&self) -> Option<&ErrorEntry> {
        self.recent.back()
    }

    pub fn recent(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.recent.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
