//! Notification record - one outbound status message

use crate::domain::call::value_object::ProviderStatus;
use crate::domain::shared::value_objects::{CallId, NotificationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Delivery state of a notification record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Pending,
    Retrying,
    Sent,
    Failed,
}

impl DeliveryState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, next: &DeliveryState) -> bool {
        use DeliveryState::*;

        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Retrying)
                | (Pending, Failed)
                | (Retrying, Retrying)
                | (Retrying, Sent)
                | (Retrying, Failed)
        )
    }

    /// Sent and Failed records are never picked up again
    pub fn is_final(&self) -> bool {
        matches!(self, DeliveryState::Sent | DeliveryState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "PENDING",
            DeliveryState::Retrying => "RETRYING",
            DeliveryState::Sent => "SENT",
            DeliveryState::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(DeliveryState::Pending),
            "RETRYING" => Some(DeliveryState::Retrying),
            "SENT" => Some(DeliveryState::Sent),
            "FAILED" => Some(DeliveryState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Terminal notifications jump ahead of progress updates
/// of other calls within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Normal,
    High,
}

impl NotificationPriority {
    pub fn as_i16(&self) -> i16 {
        match self {
            NotificationPriority::Normal => 0,
            NotificationPriority::High => 1,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        if value > 0 {
            NotificationPriority::High
        } else {
            NotificationPriority::Normal
        }
    }
}

/// Hex sha256 of the rendered text, keyed by call and kind
pub fn content_hash(call_id: &CallId, kind: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(call_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Queued outbound status message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub call_id: CallId,
    pub kind: String,
    pub target_channel: String,
    pub text: String,
    pub content_hash: String,
    pub provider_status: Option<ProviderStatus>,
    pub priority: NotificationPriority,
    /// Enqueue order, global across calls
    pub sequence: u64,
    pub delivery_state: DeliveryState,
    pub retry_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: CallId,
        kind: String,
        target_channel: String,
        text: String,
        provider_status: Option<ProviderStatus>,
        priority: NotificationPriority,
        sequence: u64,
    ) -> Self {
        let now = Utc::now();
        let content_hash = content_hash(&call_id, &kind, &text);
        Self {
            id: NotificationId::new(),
            call_id,
            kind,
            target_channel,
            text,
            content_hash,
            provider_status,
            priority,
            sequence,
            delivery_state: DeliveryState::Pending,
            retry_count: 0,
            next_attempt_at: now,
            last_error: None,
            provider_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.delivery_state.is_final() && self.next_attempt_at <= now
    }
}

/// State change written back after a delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub state: DeliveryState,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
    pub retry_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl DeliveryUpdate {
    pub fn sent(provider_message_id: String, retry_count: u32) -> Self {
        Self {
            state: DeliveryState::Sent,
            error: None,
            provider_message_id: Some(provider_message_id),
            retry_count,
            next_attempt_at: None,
        }
    }

    pub fn retrying(error: String, retry_count: u32, next_attempt_at: DateTime<Utc>) -> Self {
        Self {
            state: DeliveryState::Retrying,
            error: Some(error),
            provider_message_id: None,
            retry_count,
            next_attempt_at: Some(next_attempt_at),
        }
    }

    pub fn failed(error: String, retry_count: u32) -> Self {
        Self {
            state: DeliveryState::Failed,
            error: Some(error),
            provider_message_id: None,
            retry_count,
            next_attempt_at: None,
        }
    }

    /// Apply onto a stored record; refuses non-monotonic transitions
    pub fn apply_to(&self, record: &mut NotificationRecord) -> bool {
        if !record.delivery_state.can_transition_to(&self.state) {
            return false;
        }
        record.delivery_state = self.state;
        record.retry_count = self.retry_count;
        record.last_error = self.error.clone();
        if let Some(id) = &self.provider_message_id {
            record.provider_message_id = Some(id.clone());
        }
        if let Some(at) = self.next_attempt_at {
            record.next_attempt_at = at;
        }
        record.updated_at = Utc::now();
        true
    }
}
