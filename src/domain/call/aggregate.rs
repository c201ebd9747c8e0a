//! CallSession aggregate root

use crate::domain::call::error_metrics::ErrorMetrics;
use crate::domain::call::event::{
    InputFailed, SessionEvent, SessionEventBase, SessionFinalized, StageCompleted, StatusChanged,
};
use crate::domain::call::record::CallRecord;
use crate::domain::call::strategy::{CallStrategy, META_CHAT_ID};
use crate::domain::call::value_object::{CallPhase, CallType, ProviderStatus, TerminationReason};
use crate::domain::collection::stage::StageCollector;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{Address, CallId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

const MAX_TRANSCRIPT_TURNS: usize = 20;

/// Effect of a provider status on the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEffect {
    /// Phase moved forward
    Progressed(CallPhase),
    /// Accepted, but the session is already at or past that point
    Unchanged,
    /// Identical to the last status received
    Duplicate,
    /// Terminal status on a session that still needs finalizing
    Terminal,
    /// Terminal status on an already finalized session
    AlreadyFinalized,
}

/// One exchange in a conversational call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub caller: String,
    pub reply: String,
    pub degraded: bool,
    pub at: DateTime<Utc>,
}

/// Read-only view for the management API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub call_id: CallId,
    pub call_type: CallType,
    pub phase: CallPhase,
    pub outcome: Option<CallPhase>,
    pub provider_status: Option<ProviderStatus>,
    pub active_stage: Option<String>,
    pub stages_completed: usize,
    pub stages_total: usize,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub error_count: u64,
    pub cleaned_up: bool,
}

/// CallSession aggregate root
///
/// Owns the phase machine, stage plan, conversation history and error
/// metrics of one call. It performs no I/O: the orchestrator drives it and
/// drains the pending events it records.
#[derive(Debug)]
pub struct CallSession {
    id: CallId,
    call_type: CallType,
    strategy: CallStrategy,
    phase: CallPhase,
    metadata: BTreeMap<String, String>,
    destination: Option<Address>,
    origin: Option<Address>,
    provider_status: Option<ProviderStatus>,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    stages: Vec<StageCollector>,
    stage_index: usize,
    transcript: VecDeque<ConversationTurn>,
    termination: Option<TerminationReason>,
    final_outcome: Option<CallPhase>,
    error_metrics: ErrorMetrics,
    cleaned_up: bool,
    events: Vec<SessionEvent>,
}

impl CallSession {
    pub fn new(
        id: CallId,
        call_type: CallType,
        strategy: CallStrategy,
        stages: Vec<StageCollector>,
        metadata: BTreeMap<String, String>,
        max_duration: Duration,
    ) -> Self {
        let started_at = Utc::now();
        let deadline = started_at
            + ChronoDuration::from_std(max_duration).unwrap_or_else(|_| ChronoDuration::hours(1));
        Self {
            id,
            call_type,
            strategy,
            phase: CallPhase::Initiated,
            metadata,
            destination: None,
            origin: None,
            provider_status: None,
            started_at,
            deadline,
            answered_at: None,
            ended_at: None,
            stages,
            stage_index: 0,
            transcript: VecDeque::new(),
            termination: None,
            final_outcome: None,
            error_metrics: ErrorMetrics::new(),
            cleaned_up: false,
            events: Vec::new(),
        }
    }

    pub fn with_endpoints(mut self, destination: Address, origin: Address) -> Self {
        self.destination = Some(destination);
        self.origin = Some(origin);
        self
    }

    /// Apply a provider status: progress forward, ignore stale or repeated
    /// statuses, and report terminal ones for finalization.
    pub fn apply_provider_status(
        &mut self,
        status: ProviderStatus,
        duration_seconds: Option<u64>,
        error: Option<String>,
    ) -> StatusEffect {
        if self.termination.is_some() || self.phase.is_completed() {
            return if status.is_terminal() {
                StatusEffect::AlreadyFinalized
            } else {
                StatusEffect::Unchanged
            };
        }
        if self.provider_status == Some(status) {
            return StatusEffect::Duplicate;
        }

        self.provider_status = Some(status);
        let target = self.target().map(str::to_string);
        self.record_event(SessionEvent::StatusChanged(StatusChanged {
            base: SessionEventBase::new("session.status_changed", &self.id, target.as_deref()),
            status,
            duration_seconds,
            error,
        }));

        if status.is_terminal() {
            return StatusEffect::Terminal;
        }

        match status.progress_phase() {
            Some(next)
                if next.progress_rank() > self.phase.progress_rank()
                    && self.phase.can_transition_to(&next) =>
            {
                self.phase = next;
                if matches!(next, CallPhase::Answered | CallPhase::InProgress) {
                    self.answered_at.get_or_insert_with(Utc::now);
                }
                StatusEffect::Progressed(next)
            }
            _ => StatusEffect::Unchanged,
        }
    }

    /// Mark the call answered and in progress (inbound webhook accepted)
    pub fn accept(&mut self) -> Result<()> {
        if self.phase.progress_rank() < CallPhase::InProgress.progress_rank() {
            self.transition_to(CallPhase::InProgress)?;
            self.answered_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    /// Enter input collection for the current stage, if one remains
    pub fn begin_collection(&mut self) -> Result<Option<&StageCollector>> {
        if self.stage_index >= self.stages.len() {
            return Ok(None);
        }
        if self.phase != CallPhase::CollectingInput {
            self.transition_to(CallPhase::CollectingInput)?;
        }
        Ok(self.stages.get(self.stage_index))
    }

    /// A flushed entry is being judged
    pub fn begin_validation(&mut self) -> Result<()> {
        self.transition_to(CallPhase::Validating)
    }

    /// Current stage rejected the entry but has attempts left
    pub fn retry_stage(&mut self) -> Result<()> {
        self.transition_to(CallPhase::CollectingInput)
    }

    /// Current stage accepted its entry; returns whether stages remain
    pub fn complete_stage(&mut self) -> Result<bool> {
        let stage = self
            .stages
            .get(self.stage_index)
            .ok_or_else(|| DomainError::Internal("no active stage".to_string()))?;
        let event = SessionEvent::StageCompleted(StageCompleted {
            base: SessionEventBase::new("session.stage_completed", &self.id, self.target()),
            stage_key: stage.stage_key().to_string(),
            scenario: stage.scenario().to_string(),
            digit_count: stage.expected_length(),
            attempts: stage.attempts(),
        });
        self.record_event(event);

        self.stage_index += 1;
        if self.stage_index < self.stages.len() {
            self.transition_to(CallPhase::CollectingInput)?;
            Ok(true)
        } else {
            self.transition_to(CallPhase::Success)?;
            Ok(false)
        }
    }

    /// Current stage exhausted its attempts
    pub fn fail_stage(&mut self) -> Result<()> {
        if let Some(stage) = self.stages.get(self.stage_index) {
            let event = SessionEvent::InputFailed(InputFailed {
                base: SessionEventBase::new("session.input_failed", &self.id, self.target()),
                stage_key: stage.stage_key().to_string(),
                attempts: stage.attempts(),
            });
            self.record_event(event);
        }
        self.transition_to(CallPhase::Fail)
    }

    /// Start finalization. Returns `false` if the session was already
    /// finalizing, so the caller runs finalize exactly once.
    pub fn begin_finalize(&mut self, reason: TerminationReason) -> bool {
        if self.termination.is_some() || self.phase.is_completed() {
            return false;
        }
        if !self.phase.is_outcome() && reason.is_failure() {
            self.phase = CallPhase::Fail;
        }
        self.ended_at = Some(Utc::now());
        self.termination = Some(reason);
        true
    }

    /// Finish finalization: record the outcome event and move to Completed
    pub fn complete(&mut self) {
        if self.phase.is_completed() {
            return;
        }
        let outcome = if self.phase.is_outcome() {
            self.phase
        } else {
            CallPhase::Completed
        };
        let reason = self
            .termination
            .clone()
            .unwrap_or_else(|| TerminationReason::Explicit("finalize".to_string()));
        let event = SessionEvent::Finalized(SessionFinalized {
            base: SessionEventBase::new("session.finalized", &self.id, self.target()),
            outcome,
            reason,
            duration_seconds: self.elapsed_seconds(),
        });
        self.record_event(event);
        self.final_outcome = Some(outcome);
        self.phase = CallPhase::Completed;
    }

    /// Flip `cleaned_up` false→true; `false` if it was already set
    pub fn mark_cleaned_up(&mut self) -> bool {
        if self.cleaned_up {
            return false;
        }
        self.cleaned_up = true;
        true
    }

    pub fn record_error(&mut self, operation: &str, error: &DomainError) {
        self.error_metrics.record(operation, error.to_string());
    }

    pub fn push_turn(&mut self, caller: String, reply: String, degraded: bool) {
        if self.transcript.len() == MAX_TRANSCRIPT_TURNS {
            self.transcript.pop_front();
        }
        self.transcript.push_back(ConversationTurn {
            caller,
            reply,
            degraded,
            at: Utc::now(),
        });
    }

    /// Take all pending events
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn transition_to(&mut self, next: CallPhase) -> Result<()> {
        if !self.phase.can_transition_to(&next) {
            return Err(DomainError::InvalidStateTransition(format!(
                "call {}: cannot transition from {} to {}",
                self.id, self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    fn record_event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub fn to_record(&self) -> CallRecord {
        CallRecord {
            call_id: self.id.clone(),
            call_type: self.call_type,
            phase: self.phase,
            outcome: self.outcome(),
            destination: self.destination.as_ref().map(|a| a.to_string()),
            origin: self.origin.as_ref().map(|a| a.to_string()),
            metadata: self.metadata.clone(),
            provider_status: self.provider_status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_seconds: self.ended_at.map(|_| self.elapsed_seconds()),
            termination_reason: self.termination.as_ref().map(|r| r.as_str()),
            error_count: self.error_metrics.count(),
            last_error: self.error_metrics.last_error().map(|e| e.message.clone()),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            call_id: self.id.clone(),
            call_type: self.call_type,
            phase: self.phase,
            outcome: self.outcome(),
            provider_status: self.provider_status,
            active_stage: self.active_stage().map(|s| s.stage_key().to_string()),
            stages_completed: self.stage_index.min(self.stages.len()),
            stages_total: self.stages.len(),
            attempts: self.active_stage().map(|s| s.attempts()).unwrap_or(0),
            started_at: self.started_at,
            deadline: self.deadline,
            error_count: self.error_metrics.count(),
            cleaned_up: self.cleaned_up,
        }
    }

    // Getters
    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn strategy(&self) -> &CallStrategy {
        &self.strategy
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Messaging channel override carried in metadata
    pub fn target(&self) -> Option<&str> {
        self.metadata.get(META_CHAT_ID).map(String::as_str)
    }

    pub fn provider_status(&self) -> Option<ProviderStatus> {
        self.provider_status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    pub fn elapsed_seconds(&self) -> i64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds().max(0)
    }

    pub fn stages(&self) -> &[StageCollector] {
        &self.stages
    }

    pub fn active_stage(&self) -> Option<&StageCollector> {
        self.stages.get(self.stage_index)
    }

    pub fn active_stage_mut(&mut self) -> Option<&mut StageCollector> {
        self.stages.get_mut(self.stage_index)
    }

    pub fn stage(&self, stage_key: &str) -> Option<&StageCollector> {
        self.stages.iter().find(|s| s.stage_key() == stage_key)
    }

    pub fn stage_mut(&mut self, stage_key: &str) -> Option<&mut StageCollector> {
        self.stages.iter_mut().find(|s| s.stage_key() == stage_key)
    }

    pub fn transcript(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.transcript.iter()
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    /// Success or Fail once reached; Completed for a call that ended
    /// without a verdict
    pub fn outcome(&self) -> Option<CallPhase> {
        if self.phase.is_outcome() {
            return Some(self.phase);
        }
        self.final_outcome
    }

    pub fn is_finalizing(&self) -> bool {
        self.termination.is_some()
    }

    pub fn error_metrics(&self) -> &ErrorMetrics {
        &self.error_metrics
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }
}
