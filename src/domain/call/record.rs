//! Persisted shapes of a call session

use crate::domain::call::value_object::{CallPhase, CallType, ProviderStatus};
use crate::domain::shared::value_objects::CallId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Stored call row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub call_type: CallType,
    pub phase: CallPhase,
    /// Success or Fail once the session has been finalized
    pub outcome: Option<CallPhase>,
    pub destination: Option<String>,
    pub origin: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub provider_status: Option<ProviderStatus>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub termination_reason: Option<String>,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// Partial update of a [`CallRecord`]; `None` leaves a column untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallPatch {
    pub phase: Option<CallPhase>,
    pub outcome: Option<CallPhase>,
    pub provider_status: Option<ProviderStatus>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub termination_reason: Option<String>,
    pub error_count: Option<u64>,
    pub last_error: Option<String>,
}

impl CallPatch {
    pub fn phase(phase: CallPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply this patch onto a stored record
    pub fn apply_to(&self, record: &mut CallRecord) {
        if let Some(phase) = self.phase {
            record.phase = phase;
        }
        if let Some(outcome) = self.outcome {
            record.outcome = Some(outcome);
        }
        if let Some(status) = self.provider_status {
            record.provider_status = Some(status);
        }
        if let Some(ended_at) = self.ended_at {
            record.ended_at = Some(ended_at);
        }
        if let Some(duration) = self.duration_seconds {
            record.duration_seconds = Some(duration);
        }
        if let Some(reason) = &self.termination_reason {
            record.termination_reason = Some(reason.clone());
        }
        if let Some(count) = self.error_count {
            record.error_count = count;
        }
        if let Some(error) = &self.last_error {
            record.last_error = Some(error.clone());
        }
    }
}

/// Audit row for an accepted keypad entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInputRecord {
    pub id: Uuid,
    pub call_id: CallId,
    pub stage_key: String,
    pub scenario: String,
    pub value: String,
    pub attempts: u32,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Severity of a service health log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Info,
    Warning,
    Error,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Info => "info",
            HealthLevel::Warning => "warning",
            HealthLevel::Error => "error",
        }
    }
}
