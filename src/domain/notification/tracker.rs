//! Per-call de-duplication and ordering state for notifications

use crate::domain::call::value_object::ProviderStatus;
use crate::domain::shared::value_objects::CallId;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Whether a notification may be enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    /// Same kind as the last notification of the call
    Duplicate,
    /// Identical content already delivered for the call
    Redelivered,
    /// Status lower in the provider order than one already notified
    OutOfOrder,
    /// Call already reported a terminal status
    Closed,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateDecision::Accept => "accept",
            GateDecision::Duplicate => "duplicate",
            GateDecision::Redelivered => "redelivered",
            GateDecision::OutOfOrder => "out_of_order",
            GateDecision::Closed => "closed",
        }
    }
}

/// Notification history of one call
#[derive(Debug, Clone)]
pub struct CallTracker {
    last_kind: Option<String>,
    highest_rank: Option<u8>,
    terminal_status_seen: bool,
    hashes: HashSet<String>,
    terminal_at: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
}

impl CallTracker {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_kind: None,
            highest_rank: None,
            terminal_status_seen: false,
            hashes: HashSet::new(),
            terminal_at: None,
            last_activity: now,
        }
    }

    /// Decide on a notification and record it when accepted
    pub fn admit(
        &mut self,
        kind: &str,
        status: Option<ProviderStatus>,
        content_hash: &str,
        terminal: bool,
        now: DateTime<Utc>,
    ) -> GateDecision {
        self.last_activity = now;

        if self.hashes.contains(content_hash) {
            return GateDecision::Redelivered;
        }
        if self.last_kind.as_deref() == Some(kind) {
            return GateDecision::Duplicate;
        }
        if let Some(status) = status {
            if self.terminal_status_seen {
                return GateDecision::Closed;
            }
            // failure states pass regardless of position
            if !status.is_failure() && self.highest_rank.is_some_and(|r| status.rank() < r) {
                return GateDecision::OutOfOrder;
            }
            self.highest_rank = Some(self.highest_rank.map_or(status.rank(), |r| r.max(status.rank())));
            self.terminal_status_seen = status.is_terminal();
        }

        self.last_kind = Some(kind.to_string());
        self.hashes.insert(content_hash.to_string());
        if terminal && self.terminal_at.is_none() {
            self.terminal_at = Some(now);
        }
        GateDecision::Accept
    }

    pub fn last_kind(&self) -> Option<&str> {
        self.last_kind.as_deref()
    }

    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        self.terminal_at
    }

    fn is_expired(&self, now: DateTime<Utc>, retention: Duration, idle: Duration) -> bool {
        match self.terminal_at {
            Some(at) => now - at >= retention,
            None => now - self.last_activity >= idle,
        }
    }
}

/// Trackers for every call with recent notifications
#[derive(Debug, Default)]
pub struct TrackerTable {
    calls: HashMap<CallId, CallTracker>,
}

impl TrackerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(
        &mut self,
        call_id: &CallId,
        kind: &str,
        status: Option<ProviderStatus>,
        content_hash: &str,
        terminal: bool,
        now: DateTime<Utc>,
    ) -> GateDecision {
        self.calls
            .entry(call_id.clone())
            .or_insert_with(|| CallTracker::new(now))
            .admit(kind, status, content_hash, terminal, now)
    }

    pub fn get(&self, call_id: &CallId) -> Option<&CallTracker> {
        self.calls.get(call_id)
    }

    /// Drop trackers `retention` after their terminal notification, or after
    /// `idle` without activity. Returns how many were evicted.
    pub fn evict_expired(&mut self, now: DateTime<Utc>, retention: Duration, idle: Duration) -> usize {
        let before = self.calls.len();
        self.calls
            .retain(|_, tracker| !tracker.is_expired(now, retention, idle));
        before - self.calls.len()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
