//! Session transition events, passed to the notification pipeline

use crate::domain::call::value_object::{CallPhase, ProviderStatus, TerminationReason};
use crate::domain::shared::events::{DomainEvent, EventMetadata};
use crate::domain::shared::value_objects::CallId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Base struct for all session events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventBase {
    pub metadata: EventMetadata,
    pub call_id: CallId,
    /// Messaging channel the session asked to be notified on
    pub target: Option<String>,
}

impl SessionEventBase {
    pub fn new(event_type: &str, call_id: &CallId, target: Option<&str>) -> Self {
        Self {
            metadata: EventMetadata::new(event_type),
            call_id: call_id.clone(),
            target: target.map(str::to_string),
        }
    }
}

/// Provider status accepted for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub base: SessionEventBase,
    pub status: ProviderStatus,
    pub duration_seconds: Option<u64>,
    pub error: Option<String>,
}

impl DomainEvent for StatusChanged {
    fn event_type(&self) -> &'static str {
        "session.status_changed"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// A keypad stage accepted its entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCompleted {
    pub base: SessionEventBase,
    pub stage_key: String,
    pub scenario: String,
    pub digit_count: usize,
    pub attempts: u32,
}

impl DomainEvent for StageCompleted {
    fn event_type(&self) -> &'static str {
        "session.stage_completed"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// A keypad stage ran out of attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFailed {
    pub base: SessionEventBase,
    pub stage_key: String,
    pub attempts: u32,
}

impl DomainEvent for InputFailed {
    fn event_type(&self) -> &'static str {
        "session.input_failed"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// Session outcome persisted and resources released
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFinalized {
    pub base: SessionEventBase,
    pub outcome: CallPhase,
    pub reason: TerminationReason,
    pub duration_seconds: i64,
}

impl DomainEvent for SessionFinalized {
    fn event_type(&self) -> &'static str {
        "session.finalized"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.base.metadata.occurred_at
    }
}

/// Union of all session events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    StatusChanged(StatusChanged),
    StageCompleted(StageCompleted),
    InputFailed(InputFailed),
    Finalized(SessionFinalized),
}

impl SessionEvent {
    fn base(&self) -> &SessionEventBase {
        match self {
            SessionEvent::StatusChanged(e) => &e.base,
            SessionEvent::StageCompleted(e) => &e.base,
            SessionEvent::InputFailed(e) => &e.base,
            SessionEvent::Finalized(e) => &e.base,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.base().call_id
    }

    pub fn target(&self) -> Option<&str> {
        self.base().target.as_deref()
    }

    /// The concrete event behind the union
    pub fn as_domain_event(&self) -> &dyn DomainEvent {
        match self {
            SessionEvent::StatusChanged(e) => e,
            SessionEvent::StageCompleted(e) => e,
            SessionEvent::InputFailed(e) => e,
            SessionEvent::Finalized(e) => e,
        }
    }

    /// Provider status carried by the event, if it is a status event
    pub fn provider_status(&self) -> Option<ProviderStatus> {
        match self {
            SessionEvent::StatusChanged(e) => Some(e.status),
            _ => None,
        }
    }

    /// Notification kind; consecutive events of the same kind for a call are
    /// suppressed
    pub fn kind(&self) -> String {
        match self {
            SessionEvent::StatusChanged(e) => format!("status:{}", e.status),
            SessionEvent::StageCompleted(e) => format!("stage_completed:{}", e.stage_key),
            SessionEvent::InputFailed(e) => format!("input_failed:{}", e.stage_key),
            SessionEvent::Finalized(_) => "finalized".to_string(),
        }
    }

    /// Terminal events close the call's notification stream
    pub fn is_terminal(&self) -> bool {
        match self {
            SessionEvent::StatusChanged(e) => e.status.is_terminal(),
            SessionEvent::Finalized(_) => true,
            _ => false,
        }
    }
}

impl DomainEvent for SessionEvent {
    fn event_type(&self) -> &'static str {
        self.as_domain_event().event_type()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.as_domain_event().occurred_at()
    }
}
