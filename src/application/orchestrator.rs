//! Call orchestrator - drives call sessions from provider webhooks
//!
//! Every operation on one call runs under that session's lock, so a status
//! callback and a keypad callback arriving together are applied one after the
//! other. Other calls are never blocked: the registry map is only held for
//! lookup and insert.
//!
//! Collaborator calls made under the lock give up once the call's deadline
//! fires, so a hung repository or provider cannot hold the lock past it.
//! Calls on the release path are bounded by `release_timeout` instead.

use crate::application::conversation::ConversationService;
use crate::application::notification_pipeline::EventPublisher;
use crate::application::registry::{SessionHandle, SessionRegistry, SessionState};
use crate::application::timers::{self, TimerEvent};
use crate::domain::call::aggregate::{CallSession, SessionSummary, StatusEffect};
use crate::domain::call::record::{CallInputRecord, CallPatch, CallRecord, HealthLevel};
use crate::domain::call::repository::CallRepository;
use crate::domain::call::strategy::{CallStrategy, StrategyContext, META_SCENARIO, META_STAGES};
use crate::domain::call::value_object::{CallPhase, CallType, ProviderStatus, TerminationReason};
use crate::domain::collection::outcome::{CallAction, InputOutcome};
use crate::domain::collection::scenario::ScenarioCatalog;
use crate::domain::collection::stage::{AppendResult, StageVerdict};
use crate::domain::gateway::{CallUpdate, CompletionContext, GatherSpec, TelephonyGateway};
use crate::domain::shared::error::{Collaborator, DomainError};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{Address, CallId};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_duration: Duration,
    pub inactivity_window: Duration,
    pub terminal_grace: Duration,
    /// Bound on each collaborator call made while releasing a session
    pub release_timeout: Duration,
    pub accept_unverified_input: bool,
    pub default_scenario: String,
    /// Base URL the provider calls back on
    pub callback_base_url: String,
    /// Origin used when an outbound request names none
    pub default_origin: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(3600),
            inactivity_window: Duration::from_millis(1500),
            terminal_grace: Duration::from_secs(60),
            release_timeout: Duration::from_secs(5),
            accept_unverified_input: false,
            default_scenario: "otp".to_string(),
            callback_base_url: "http://localhost:8080".to_string(),
            default_origin: None,
        }
    }
}

/// Outbound call request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitiateCall {
    pub call_type: Option<CallType>,
    pub destination: Option<String>,
    pub origin: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatedCall {
    pub call_id: CallId,
    pub call_type: CallType,
    pub phase: CallPhase,
    pub deadline: DateTime<Utc>,
}

/// Provider "call accepted" webhook
#[derive(Debug, Clone, Default)]
pub struct IncomingCall {
    pub call_id: String,
    pub call_type: Option<CallType>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// What the provider should do next on the line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInstruction {
    pub call_id: CallId,
    pub action: CallAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gather: Option<GatherSpec>,
}

/// Provider status webhook
#[derive(Debug, Clone, Default)]
pub struct StatusCallback {
    pub call_id: String,
    pub status: String,
    pub duration_seconds: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusOutcome {
    pub call_id: CallId,
    pub phase: CallPhase,
    pub applied: bool,
    pub finalized: bool,
}

/// Provider keypad webhook
#[derive(Debug, Clone, Default)]
pub struct DtmfInput {
    pub call_id: String,
    pub digits: String,
    pub stage_key: Option<String>,
    /// Provider delivery id, repeated on redelivery
    pub event_id: Option<String>,
    /// One keystroke per callback; flushed after the inactivity window or `#`
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechReply {
    pub call_id: CallId,
    pub text: String,
    pub degraded: bool,
    pub action: CallAction,
}

/// A call as seen by the management API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", content = "call", rename_all = "snake_case")]
pub enum CallLookup {
    Live(SessionSummary),
    Stored(CallRecord),
}

pub struct CallOrchestrator {
    registry: Arc<SessionRegistry>,
    catalog: Arc<ScenarioCatalog>,
    repository: Arc<dyn CallRepository>,
    telephony: Arc<dyn TelephonyGateway>,
    conversation: Arc<ConversationService>,
    publisher: EventPublisher,
    timer_tx: UnboundedSender<TimerEvent>,
    settings: OrchestratorSettings,
}

impl CallOrchestrator {
    /// Build the orchestrator and the receiving end of its timer channel,
    /// which [`run_timers`](Self::run_timers) consumes.
    pub fn new(
        registry: Arc<SessionRegistry>,
        catalog: Arc<ScenarioCatalog>,
        repository: Arc<dyn CallRepository>,
        telephony: Arc<dyn TelephonyGateway>,
        conversation: Arc<ConversationService>,
        publisher: EventPublisher,
        settings: OrchestratorSettings,
    ) -> (Arc<Self>, UnboundedReceiver<TimerEvent>) {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            registry,
            catalog,
            repository,
            telephony,
            conversation,
            publisher,
            timer_tx,
            settings,
        });
        (orchestrator, timer_rx)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn conversation(&self) -> &Arc<ConversationService> {
        &self.conversation
    }

    pub fn catalog(&self) -> &Arc<ScenarioCatalog> {
        &self.catalog
    }

    fn strategy_context(&self) -> StrategyContext<'_> {
        StrategyContext {
            catalog: &self.catalog,
            default_scenario: &self.settings.default_scenario,
            accept_unverified_input: self.settings.accept_unverified_input,
        }
    }

    /// Place an outbound call and start tracking it
    pub async fn initiate(&self, request: InitiateCall) -> Result<InitiatedCall> {
        let destination = Address::parse("destination", request.destination.as_deref())?;
        let origin_raw = request
            .origin
            .as_deref()
            .or(self.settings.default_origin.as_deref());
        let origin = Address::parse("origin", origin_raw)?;
        let call_type = request
            .call_type
            .unwrap_or_else(|| infer_call_type(&request.metadata));
        let (strategy, stages) =
            CallStrategy::select(call_type, &request.metadata, self.strategy_context())?;

        if !self.telephony.is_configured() {
            return Err(DomainError::Configuration(
                "telephony credentials are not configured".to_string(),
            ));
        }

        let callback_url = format!(
            "{}/webhooks/incoming-call",
            self.settings.callback_base_url.trim_end_matches('/')
        );
        let call_id = match self
            .telephony
            .place_call(&destination, &origin, &callback_url)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(destination = %destination, error = %e, "Call placement failed");
                counter!("collaborator_errors_total", "operation" => "place_call").increment(1);
                return Err(e);
            }
        };

        let session = CallSession::new(
            call_id.clone(),
            call_type,
            strategy,
            stages,
            request.metadata,
            self.settings.max_duration,
        )
        .with_endpoints(destination, origin);
        let handle = Arc::new(SessionHandle::new(session, self.timer_tx.clone()));
        if !self.registry.insert(handle.clone()).await {
            return Err(DomainError::Internal(format!(
                "provider reused call id {}",
                call_id
            )));
        }

        let mut state = handle.lock().await;
        state.timers.start_deadline(self.settings.max_duration);
        counter!("calls_initiated_total", "type" => call_type.as_str()).increment(1);
        info!(call_id = %call_id, call_type = %call_type, "Outbound call placed");

        if let Err(e) = self.save_record(&handle, &mut state).await {
            // the call is ringing; the next webhook for it saves the row again
            error!(call_id = %call_id, error = %e, "Call placed but its record was not saved");
            return Err(e);
        }

        Ok(InitiatedCall {
            call_id,
            call_type,
            phase: state.session.phase(),
            deadline: state.session.deadline(),
        })
    }

    /// Provider asks for instructions: an outbound call was answered, or an
    /// inbound call arrived. Redelivery returns the current instruction.
    pub async fn handle_incoming(&self, incoming: IncomingCall) -> Result<CallInstruction> {
        let call_id = CallId::parse(&incoming.call_id)?;

        let handle = match self.registry.get(&call_id).await {
            Some(handle) => handle,
            None => {
                let call_type = incoming
                    .call_type
                    .unwrap_or_else(|| infer_call_type(&incoming.metadata));
                let (strategy, stages) =
                    CallStrategy::select(call_type, &incoming.metadata, self.strategy_context())?;
                let mut session = CallSession::new(
                    call_id.clone(),
                    call_type,
                    strategy,
                    stages,
                    incoming.metadata.clone(),
                    self.settings.max_duration,
                );
                if let (Some(from), Some(to)) = (incoming.from.as_deref(), incoming.to.as_deref()) {
                    if let (Ok(origin), Ok(destination)) = (
                        Address::parse("from", Some(from)),
                        Address::parse("to", Some(to)),
                    ) {
                        session = session.with_endpoints(destination, origin);
                    }
                }
                let timer_tx = self.timer_tx.clone();
                let (handle, created) = self
                    .registry
                    .get_or_insert_with(&call_id, move || SessionHandle::new(session, timer_tx))
                    .await;
                if created {
                    let mut state = handle.lock().await;
                    state.timers.start_deadline(self.settings.max_duration);
                    counter!("calls_accepted_total", "type" => call_type.as_str()).increment(1);
                    info!(call_id = %call_id, call_type = %call_type, "Inbound call accepted");
                }
                handle
            }
        };

        let mut state = handle.lock().await;
        if state.session.is_finalizing() || state.session.is_cleaned_up() {
            return Ok(CallInstruction {
                call_id,
                action: CallAction::Hangup,
                prompt: None,
                stage_key: None,
                gather: None,
            });
        }

        // a failed save is retried on every redelivery until it sticks
        if !state.record_saved {
            self.save_record(&handle, &mut state).await?;
        }

        let fresh = state.session.phase().progress_rank() < CallPhase::InProgress.progress_rank();
        if fresh {
            state.session.accept()?;
            if state.session.begin_collection()?.is_some() {
                arm_active_stage(&mut state);
            }
            debug!(call_id = %call_id, phase = %state.session.phase(), "Session started");
        } else if state.session.phase() == CallPhase::InProgress
            && state.session.active_stage().is_some()
        {
            state.session.begin_collection()?;
            arm_active_stage(&mut state);
        }

        let instruction = current_instruction(&state.session, fresh);
        self.publish(&mut state).await;
        Ok(instruction)
    }

    /// Provider status callback
    pub async fn handle_status(&self, callback: StatusCallback) -> Result<StatusOutcome> {
        let call_id = CallId::parse(&callback.call_id)?;
        let status = ProviderStatus::parse(&callback.status)?;
        let handle = self.require(&call_id).await?;

        let mut state = handle.lock().await;
        let effect =
            state
                .session
                .apply_provider_status(status, callback.duration_seconds, callback.error.clone());
        debug!(call_id = %call_id, status = %status, effect = ?effect, "Status callback");

        let mut outcome = StatusOutcome {
            call_id: call_id.clone(),
            phase: state.session.phase(),
            applied: matches!(effect, StatusEffect::Progressed(_) | StatusEffect::Terminal),
            finalized: false,
        };

        match effect {
            StatusEffect::Terminal => {
                if let Some(error) = &callback.error {
                    warn!(call_id = %call_id, status = %status, error = %error, "Call ended with provider error");
                }
                outcome.finalized = self
                    .finalize_locked(&handle, &mut state, TerminationReason::Provider(status))
                    .await;
                outcome.phase = state.session.phase();
            }
            StatusEffect::Progressed(phase) => {
                self.publish(&mut state).await;
                if !state.record_saved {
                    // the row is written with the new phase already applied
                    self.save_record(&handle, &mut state).await?;
                } else {
                    let patch = CallPatch {
                        phase: Some(phase),
                        provider_status: Some(status),
                        ..Default::default()
                    };
                    let updated = race_deadline(
                        &handle,
                        "update_call",
                        self.repository.update_call(&call_id, &patch),
                    )
                    .await;
                    if let Err(e) = updated {
                        note_error(&mut state.session, "update_call", &e);
                        return Err(e);
                    }
                }
            }
            StatusEffect::Unchanged => {
                self.publish(&mut state).await;
            }
            StatusEffect::Duplicate | StatusEffect::AlreadyFinalized => {
                counter!("status_callbacks_ignored_total", "reason" => format!("{:?}", effect))
                    .increment(1);
            }
        }
        Ok(outcome)
    }

    /// Provider keypad callback
    pub async fn handle_input(&self, input: DtmfInput) -> Result<InputOutcome> {
        let call_id = CallId::parse(&input.call_id)?;
        let handle = self.require(&call_id).await?;
        let mut state = handle.lock().await;

        // a byte-identical entry for an already settled stage gets the same answer
        if let Some(key) = input.stage_key.as_deref() {
            if let Some(replayed) = state.session.stage(key).and_then(|s| s.replay(&input.digits)) {
                debug!(call_id = %call_id, stage = key, "Replaying settled stage outcome");
                counter!("input_redeliveries_total").increment(1);
                return Ok(replayed);
            }
        }

        if state.session.is_finalizing()
            || state.session.is_cleaned_up()
            || state.session.phase().is_outcome()
        {
            return Ok(InputOutcome::ignored(None));
        }

        if state.session.phase() != CallPhase::CollectingInput {
            if state.session.active_stage().is_none() {
                return Ok(InputOutcome::ignored(None));
            }
            state.session.accept()?;
            state.session.begin_collection()?;
            arm_active_stage(&mut state);
        }

        let Some(stage) = state.session.active_stage_mut() else {
            return Ok(InputOutcome::ignored(None));
        };
        if let Some(key) = input.stage_key.as_deref() {
            if key != stage.stage_key() {
                debug!(call_id = %call_id, stage = key, active = stage.stage_key(), "Input for inactive stage ignored");
                return Ok(InputOutcome::ignored(None));
            }
        }

        let stage_key = stage.stage_key().to_string();
        match stage.append(&input.digits, input.event_id.as_deref()) {
            AppendResult::Duplicate => {
                counter!("input_redeliveries_total").increment(1);
                Ok(InputOutcome::buffering(&stage_key, stage.attempts()).as_duplicate())
            }
            AppendResult::Frozen => Ok(InputOutcome::ignored(None)),
            AppendResult::Buffered if input.partial => {
                let attempts = stage.attempts();
                state
                    .timers
                    .arm_flush(&stage_key, self.settings.inactivity_window);
                Ok(InputOutcome::buffering(&stage_key, attempts))
            }
            AppendResult::Buffered | AppendResult::Terminated => {
                state.timers.cancel_flush();
                self.evaluate_locked(&handle, &mut state).await
            }
        }
    }

    /// Conversational turn. The session lock is released while the
    /// completion service runs.
    pub async fn handle_speech(&self, call_id: &str, text: &str) -> Result<SpeechReply> {
        let call_id = CallId::parse(call_id)?;
        let handle = self.require(&call_id).await?;

        let context = {
            let mut state = handle.lock().await;
            if !matches!(state.session.strategy(), CallStrategy::Conversational { .. }) {
                return Err(DomainError::Validation(format!(
                    "speech input on a {} call",
                    state.session.call_type()
                )));
            }
            if state.session.is_finalizing() {
                return Ok(hangup_reply(call_id));
            }
            if state.session.phase().progress_rank() < CallPhase::InProgress.progress_rank() {
                state.session.accept()?;
            }
            CompletionContext {
                call_id: Some(call_id.clone()),
                history: state.session.transcript().cloned().collect(),
            }
        };

        let reply = self.conversation.respond(text, &context).await;

        let mut state = handle.lock().await;
        if handle.is_expired() || state.session.is_finalizing() {
            debug!(call_id = %call_id, "Session ended during completion, reply discarded");
            return Ok(hangup_reply(call_id));
        }
        state
            .session
            .push_turn(text.to_string(), reply.text.clone(), reply.degraded);
        Ok(SpeechReply {
            call_id,
            text: reply.text,
            degraded: reply.degraded,
            action: CallAction::Continue,
        })
    }

    /// Forced hangup from the management API: ask the provider to end the
    /// call, finalize, and drop the session right away
    pub async fn hangup(&self, call_id: &str) -> Result<SessionSummary> {
        let call_id = CallId::parse(call_id)?;
        let handle = self.require(&call_id).await?;
        let mut state = handle.lock().await;

        let mut failure = None;
        if !state.session.is_finalizing() {
            let hangup = self.bounded(
                Collaborator::Telephony,
                "update_call",
                self.telephony
                    .update_call(&call_id, CallUpdate::Hangup { text: None }),
            );
            if let Err(e) = hangup.await {
                note_error(&mut state.session, "update_call", &e);
                failure = Some(e);
            }
        }
        self.finalize_locked(&handle, &mut state, TerminationReason::Explicit("hangup".to_string()))
            .await;
        let summary = state.session.summary();
        drop(state);
        self.registry.remove(&call_id).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Explicit release: finalize a live session with an explicit reason (or
    /// just release one already finalizing), then drop it from the registry.
    /// Returns whether this call did the work.
    pub async fn cleanup(&self, call_id: &str, reason: &str) -> Result<bool> {
        let call_id = CallId::parse(call_id)?;
        let handle = self.require(&call_id).await?;
        let mut state = handle.lock().await;
        let released = if state.session.is_finalizing() {
            self.cleanup_locked(&mut state, reason).await
        } else {
            self.finalize_locked(
                &handle,
                &mut state,
                TerminationReason::Explicit(reason.to_string()),
            )
            .await
        };
        drop(state);
        self.registry.remove(&call_id).await;
        Ok(released)
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for handle in self.registry.handles().await {
            summaries.push(handle.summary().await);
        }
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        summaries
    }

    /// Live session if present, otherwise the stored record
    pub async fn lookup(&self, call_id: &str) -> Result<CallLookup> {
        let call_id = CallId::parse(call_id)?;
        if let Some(handle) = self.registry.get(&call_id).await {
            return Ok(CallLookup::Live(handle.summary().await));
        }
        match self.repository.get_call(&call_id).await? {
            Some(record) => Ok(CallLookup::Stored(record)),
            None => Err(DomainError::SessionNotFound(call_id.to_string())),
        }
    }

    /// Consume timer events until shutdown
    pub fn run_timers(
        self: Arc<Self>,
        mut events: UnboundedReceiver<TimerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = events.recv() => match maybe {
                        Some(event) => self.handle_timer(event).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Session timer loop stopped");
        })
    }

    pub async fn handle_timer(&self, event: TimerEvent) {
        let call_id = event.call_id().clone();
        let Some(handle) = self.registry.get(&call_id).await else {
            debug!(call_id = %call_id, "Timer for unknown session dropped");
            return;
        };

        match event {
            TimerEvent::Deadline { .. } => self.on_deadline(&handle).await,
            TimerEvent::StageTimeout {
                stage_key,
                generation,
                ..
            } => {
                let mut state = handle.lock().await;
                if !state.timers.is_current_stage_timeout(generation) {
                    return;
                }
                state.timers.clear_stage_timeout();
                if !self.stage_is_active(&state, &stage_key) {
                    return;
                }
                info!(call_id = %call_id, stage = %stage_key, "Stage timed out");
                counter!("stage_timeouts_total").increment(1);
                state.timers.cancel_flush();
                self.evaluate_and_push(&handle, &mut state).await;
            }
            TimerEvent::InactivityFlush {
                stage_key,
                generation,
                ..
            } => {
                let mut state = handle.lock().await;
                if !state.timers.is_current_flush(generation) {
                    return;
                }
                state.timers.clear_flush();
                if !self.stage_is_active(&state, &stage_key) {
                    return;
                }
                debug!(call_id = %call_id, stage = %stage_key, "Keystroke buffer flushed after inactivity");
                self.evaluate_and_push(&handle, &mut state).await;
            }
            TimerEvent::Evict { .. } => {
                let cleaned = handle.lock().await.session.is_cleaned_up();
                if cleaned {
                    self.registry.remove(&call_id).await;
                }
            }
        }
    }

    fn stage_is_active(&self, state: &SessionState, stage_key: &str) -> bool {
        !state.session.is_finalizing()
            && state.session.phase() == CallPhase::CollectingInput
            && state
                .session
                .active_stage()
                .is_some_and(|s| s.stage_key() == stage_key)
    }

    async fn on_deadline(&self, handle: &Arc<SessionHandle>) {
        handle.mark_expired();
        let mut state = handle.lock().await;
        if state.session.is_finalizing() {
            return;
        }
        let call_id = state.session.id().clone();
        warn!(call_id = %call_id, "Max call duration reached, forcing hangup");
        counter!("call_deadlines_total").increment(1);

        let hangup = self.bounded(
            Collaborator::Telephony,
            "update_call",
            self.telephony
                .update_call(&call_id, CallUpdate::Hangup { text: None }),
        );
        if let Err(e) = hangup.await {
            note_error(&mut state.session, "update_call", &e);
        }
        self.finalize_locked(handle, &mut state, TerminationReason::Timeout)
            .await;
    }

    /// Judge the buffered entry (timer path) and push the resulting prompt
    /// to the live call
    async fn evaluate_and_push(&self, handle: &Arc<SessionHandle>, state: &mut SessionState) {
        let call_id = state.session.id().clone();
        let outcome = match self.evaluate_locked(handle, state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Timer-driven evaluation failed");
                return;
            }
        };
        let update = match (outcome.action, outcome.prompt.clone()) {
            (CallAction::Hangup, text) => CallUpdate::Hangup { text },
            (_, Some(text)) => CallUpdate::Prompt {
                text,
                gather: outcome.expected_length.zip(outcome.timeout_seconds).map(
                    |(num_digits, timeout_seconds)| GatherSpec {
                        num_digits,
                        timeout_seconds,
                    },
                ),
            },
            (_, None) => return,
        };
        let pushed = race_deadline(
            handle,
            "update_call",
            self.telephony.update_call(&call_id, update),
        )
        .await;
        if let Err(e) = pushed {
            note_error(&mut state.session, "update_call", &e);
        }
    }

    /// Flush the active stage's buffer and judge it as one entry
    async fn evaluate_locked(
        &self,
        handle: &Arc<SessionHandle>,
        state: &mut SessionState,
    ) -> Result<InputOutcome> {
        let call_id = state.session.id().clone();
        state.session.begin_validation()?;

        let (entry, stage_key, scenario, prompts, accepted) = {
            let strategy = state.session.strategy().clone();
            let stage = state
                .session
                .active_stage_mut()
                .ok_or_else(|| DomainError::Internal("no active stage".to_string()))?;
            let entry = stage.flush();
            let accepted = strategy.accepts(stage, &entry);
            (
                entry,
                stage.stage_key().to_string(),
                stage.scenario().to_string(),
                stage.prompts().clone(),
                accepted,
            )
        };

        let verdict = match state.session.active_stage_mut() {
            Some(stage) => stage.register_attempt(&entry, accepted),
            None => return Err(DomainError::Internal("no active stage".to_string())),
        };

        match verdict {
            StageVerdict::Accepted {
                value,
                digit_count,
                attempts,
                duration,
            } => {
                state.timers.cancel_stage_timeout();
                counter!("input_attempts_total", "verdict" => "accepted").increment(1);
                info!(call_id = %call_id, stage = %stage_key, attempts, "Stage input accepted");

                let more = state.session.complete_stage()?;
                let outcome = if more {
                    let next = state
                        .session
                        .active_stage()
                        .ok_or_else(|| DomainError::Internal("next stage missing".to_string()))?;
                    let outcome = InputOutcome::advance(
                        &stage_key,
                        digit_count,
                        attempts,
                        next.stage_key(),
                        &next.prompts().initial,
                    )
                    .with_gather(next.expected_length(), next.timeout_seconds());
                    arm_active_stage(state);
                    outcome
                } else {
                    InputOutcome::complete(
                        &stage_key,
                        digit_count,
                        attempts,
                        &prompts.success,
                        state.session.strategy().completion_action(),
                    )
                };
                if let Some(settled) = state.session.stage_mut(&stage_key) {
                    settled.settle(&entry, &outcome);
                }

                let audit = CallInputRecord {
                    id: Uuid::new_v4(),
                    call_id: call_id.clone(),
                    stage_key: stage_key.clone(),
                    scenario,
                    value,
                    attempts,
                    duration_ms: duration.as_millis() as u64,
                    recorded_at: Utc::now(),
                };
                let saved = race_deadline(
                    handle,
                    "save_call_input",
                    self.repository.save_call_input(&audit),
                )
                .await;
                self.publish(state).await;
                if let Err(e) = saved {
                    note_error(&mut state.session, "save_call_input", &e);
                    return Err(e);
                }
                Ok(outcome)
            }
            StageVerdict::Retry {
                remaining,
                attempts,
            } => {
                state.session.retry_stage()?;
                counter!("input_attempts_total", "verdict" => "retry").increment(1);
                debug!(call_id = %call_id, stage = %stage_key, attempts, remaining, "Stage input rejected");
                let outcome = match state.session.active_stage() {
                    Some(stage) => InputOutcome::retry(&stage_key, &prompts.retry, remaining, attempts)
                        .with_gather(stage.expected_length(), stage.timeout_seconds()),
                    None => InputOutcome::retry(&stage_key, &prompts.retry, remaining, attempts),
                };
                arm_active_stage(state);
                Ok(outcome)
            }
            StageVerdict::Exhausted { attempts } => {
                counter!("input_attempts_total", "verdict" => "exhausted").increment(1);
                warn!(call_id = %call_id, stage = %stage_key, attempts, "Stage attempts exhausted");
                state.session.fail_stage()?;
                let outcome = InputOutcome::failed(&stage_key, &prompts.failure, attempts);
                if let Some(stage) = state.session.active_stage_mut() {
                    stage.settle(&entry, &outcome);
                }
                self.finalize_locked(handle, state, TerminationReason::InputExhausted)
                    .await;
                Ok(outcome)
            }
        }
    }

    /// Persist the outcome, release resources and move to Completed. Runs at
    /// most once per session; returns whether this call ran it. Collaborator
    /// failures here are logged and do not stop the release.
    async fn finalize_locked(
        &self,
        handle: &Arc<SessionHandle>,
        state: &mut SessionState,
        reason: TerminationReason,
    ) -> bool {
        let call_id = handle.call_id().clone();
        if !state.session.begin_finalize(reason.clone()) {
            debug!(call_id = %call_id, "Session already finalized");
            return false;
        }
        state.timers.release();

        if !state.record_saved {
            let record = state.session.to_record();
            let saved = self.bounded(
                Collaborator::Persistence,
                "save_call",
                self.repository.save_call(&record),
            );
            match saved.await {
                Ok(()) => state.record_saved = true,
                Err(e) => note_error(&mut state.session, "save_call", &e),
            }
        }

        let outcome = state.session.outcome().unwrap_or(CallPhase::Completed);
        let patch = CallPatch {
            phase: Some(CallPhase::Completed),
            outcome: Some(outcome),
            provider_status: state.session.provider_status(),
            ended_at: Some(Utc::now()),
            duration_seconds: Some(state.session.elapsed_seconds()),
            termination_reason: Some(reason.as_str()),
            error_count: Some(state.session.error_metrics().count()),
            last_error: state
                .session
                .error_metrics()
                .last_error()
                .map(|e| e.message.clone()),
        };
        let updated = self.bounded(
            Collaborator::Persistence,
            "update_call",
            self.repository.update_call(&call_id, &patch),
        );
        if let Err(e) = updated.await {
            note_error(&mut state.session, "update_call", &e);
        }

        self.cleanup_locked(state, &reason.as_str()).await;
        state.session.complete();
        self.publish(state).await;

        counter!("calls_finalized_total", "outcome" => outcome.as_str()).increment(1);
        info!(
            call_id = %call_id,
            outcome = %outcome,
            reason = %reason.as_str(),
            duration_seconds = state.session.elapsed_seconds(),
            "Session finalized"
        );
        timers::schedule_eviction(
            self.timer_tx.clone(),
            call_id,
            self.settings.terminal_grace,
        );
        true
    }

    async fn cleanup_locked(&self, state: &mut SessionState, reason: &str) -> bool {
        state.timers.release();
        if state.session.is_cleaned_up() {
            return false;
        }

        let call_id = state.session.id().clone();
        let metrics = state.session.error_metrics();
        if !metrics.is_empty() {
            let recent: Vec<_> = metrics.recent().collect();
            let details = json!({
                "call_id": call_id.to_string(),
                "reason": reason,
                "error_count": metrics.count(),
                "recent": recent,
            });
            // best effort: release continues whatever the health log says
            let logged = self.bounded(
                Collaborator::Persistence,
                "log_service_health",
                self.repository
                    .log_service_health("session_errors", HealthLevel::Warning, details),
            );
            if let Err(e) = logged.await {
                warn!(call_id = %call_id, error = %e, "Failed to flush session error metrics");
            }
        }

        state.session.mark_cleaned_up();
        debug!(call_id = %call_id, reason, "Session cleaned up");
        true
    }

    /// Write the call row; on success later webhooks stop retrying it
    async fn save_record(&self, handle: &SessionHandle, state: &mut SessionState) -> Result<()> {
        let record = state.session.to_record();
        match race_deadline(handle, "save_call", self.repository.save_call(&record)).await {
            Ok(()) => {
                state.record_saved = true;
                Ok(())
            }
            Err(e) => {
                note_error(&mut state.session, "save_call", &e);
                Err(e)
            }
        }
    }

    /// Run a release-path collaborator call, giving up after `release_timeout`
    async fn bounded<T, F>(&self, collaborator: Collaborator, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.settings.release_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::Collaborator {
                collaborator,
                message: format!(
                    "{} timed out after {:?}",
                    operation, self.settings.release_timeout
                ),
            }),
        }
    }

    async fn publish(&self, state: &mut SessionState) {
        let events = state.session.take_events();
        if !events.is_empty() {
            self.publisher.publish(events).await;
        }
    }

    async fn require(&self, call_id: &CallId) -> Result<Arc<SessionHandle>> {
        match self.registry.get(call_id).await {
            Some(handle) => Ok(handle),
            None => {
                warn!(call_id = %call_id, "Event for unknown session dropped");
                counter!("events_dropped_total", "reason" => "session_not_found").increment(1);
                Err(DomainError::SessionNotFound(call_id.to_string()))
            }
        }
    }
}

/// Keypad scenarios in metadata select pure collection, otherwise the call
/// is conversational
fn infer_call_type(metadata: &BTreeMap<String, String>) -> CallType {
    if metadata.contains_key(META_STAGES) || metadata.contains_key(META_SCENARIO) {
        CallType::PureCollection
    } else {
        CallType::Conversational
    }
}

fn note_error(session: &mut CallSession, operation: &str, error: &DomainError) {
    session.record_error(operation, error);
    counter!("collaborator_errors_total", "operation" => operation.to_string()).increment(1);
    warn!(call_id = %session.id(), operation, error = %error, "Collaborator call failed");
}

/// Await a collaborator call made under the session lock, abandoning it when
/// the session deadline fires so the deadline handler can take the lock
async fn race_deadline<T, F>(handle: &SessionHandle, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        result = call => result,
        _ = handle.expired() => {
            counter!("collaborator_calls_abandoned_total", "operation" => operation.to_string())
                .increment(1);
            warn!(call_id = %handle.call_id(), operation, "Deadline reached, collaborator call abandoned");
            Err(DomainError::SessionExpired(handle.call_id().to_string()))
        }
    }
}

fn arm_active_stage(state: &mut SessionState) {
    if state.session.is_cleaned_up() {
        return;
    }
    if let Some(stage) = state.session.active_stage() {
        let key = stage.stage_key().to_string();
        let timeout = stage.timeout();
        state.timers.arm_stage_timeout(&key, timeout);
    }
}

fn hangup_reply(call_id: CallId) -> SpeechReply {
    SpeechReply {
        call_id,
        text: String::new(),
        degraded: false,
        action: CallAction::Hangup,
    }
}

/// Instruction for the current point of the session
fn current_instruction(session: &CallSession, greet: bool) -> CallInstruction {
    let call_id = session.id().clone();
    let greeting = session.strategy().greeting().filter(|_| greet);

    match session.active_stage() {
        Some(stage) if session.phase() == CallPhase::CollectingInput => {
            let stage_prompt = if stage.attempts() == 0 {
                &stage.prompts().initial
            } else {
                &stage.prompts().retry
            };
            let prompt = match greeting {
                Some(greeting) => format!("{} {}", greeting, stage_prompt),
                None => stage_prompt.clone(),
            };
            CallInstruction {
                call_id,
                action: CallAction::Gather,
                prompt: Some(prompt),
                stage_key: Some(stage.stage_key().to_string()),
                gather: Some(GatherSpec {
                    num_digits: stage.expected_length(),
                    timeout_seconds: stage.timeout_seconds(),
                }),
            }
        }
        _ => {
            let action = match session.strategy() {
                CallStrategy::Conversational { .. } => CallAction::Continue,
                _ if session.phase() == CallPhase::Success => CallAction::Hangup,
                _ => CallAction::Wait,
            };
            CallInstruction {
                call_id,
                action,
                prompt: greeting.map(str::to_string),
                stage_key: None,
                gather: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::repository::MockCallRepository;
    use crate::domain::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use crate::domain::collection::outcome::InputStatus;
    use crate::domain::gateway::{MockCompletionService, MockTelephonyGateway};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn orchestrator(
        repo: MockCallRepository,
        telephony: MockTelephonyGateway,
    ) -> (Arc<CallOrchestrator>, mpsc::Receiver<crate::domain::call::SessionEvent>) {
        let (publisher, events) = EventPublisher::channel(64);
        let conversation = Arc::new(ConversationService::new(
            Arc::new(MockCompletionService::new()),
            Arc::new(CircuitBreaker::new("completion", CircuitBreakerConfig::default())),
            Duration::from_millis(100),
            "unavailable",
        ));
        let (orchestrator, _timers) = CallOrchestrator::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(ScenarioCatalog::builtin()),
            Arc::new(repo),
            Arc::new(telephony),
            conversation,
            publisher,
            OrchestratorSettings::default(),
        );
        (orchestrator, events)
    }

    #[tokio::test]
    async fn test_initiate_without_credentials() {
        let mut telephony = MockTelephonyGateway::new();
        telephony.expect_is_configured().return_const(false);
        telephony.expect_place_call().never();
        let (orch, _events) = orchestrator(MockCallRepository::new(), telephony);

        let err = orch
            .initiate(InitiateCall {
                call_type: Some(CallType::Conversational),
                destination: Some("+15550001111".to_string()),
                origin: Some("+15550002222".to_string()),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_initiate_missing_destination() {
        let mut telephony = MockTelephonyGateway::new();
        telephony.expect_place_call().never();
        let (orch, _events) = orchestrator(MockCallRepository::new(), telephony);

        let err = orch
            .initiate(InitiateCall {
                origin: Some("+15550002222".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn test_persistence_failure_recorded_and_rethrown() {
        let mut telephony = MockTelephonyGateway::new();
        telephony.expect_is_configured().return_const(true);
        telephony
            .expect_place_call()
            .returning(|_, _, _| Ok(CallId::parse("CA-out").unwrap()));
        let saves = Arc::new(AtomicUsize::new(0));
        let mut repo = MockCallRepository::new();
        {
            let saves = saves.clone();
            repo.expect_save_call().returning(move |_| {
                if saves.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DomainError::persistence("disk full"))
                } else {
                    Ok(())
                }
            });
        }
        let (orch, _events) = orchestrator(repo, telephony);

        let err = orch
            .initiate(InitiateCall {
                call_type: Some(CallType::Conversational),
                destination: Some("+15550001111".to_string()),
                origin: Some("+15550002222".to_string()),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_collaborator());

        // the session is kept, not failed
        let summary = match orch.lookup("CA-out").await.unwrap() {
            CallLookup::Live(summary) => summary,
            other => panic!("expected live session, got {:?}", other),
        };
        assert_eq!(summary.phase, CallPhase::Initiated);
        assert_eq!(summary.error_count, 1);

        // the answer webhook writes the missing row, redelivery does not
        for _ in 0..2 {
            let instruction = orch
                .handle_incoming(IncomingCall {
                    call_id: "CA-out".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert_eq!(instruction.action, CallAction::Continue);
        }
        assert_eq!(saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_status_dropped() {
        let (orch, _events) =
            orchestrator(MockCallRepository::new(), MockTelephonyGateway::new());
        let err = orch
            .handle_status(StatusCallback {
                call_id: "CA-missing".to_string(),
                status: "ringing".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_cleanup_errors_contained() {
        let mut repo = MockCallRepository::new();
        repo.expect_save_call().returning(|_| Ok(()));
        repo.expect_update_call()
            .returning(|_, _| Err(DomainError::persistence("timeout")));
        repo.expect_log_service_health()
            .times(1)
            .returning(|_, _, _| Err(DomainError::persistence("timeout")));
        let (orch, _events) = orchestrator(repo, MockTelephonyGateway::new());

        orch.handle_incoming(IncomingCall {
            call_id: "CA-in".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        let outcome = orch
            .handle_status(StatusCallback {
                call_id: "CA-in".to_string(),
                status: "completed".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(outcome.finalized);
        assert_eq!(outcome.phase, CallPhase::Completed);

        // cleanup already ran during finalize
        assert!(!orch.cleanup("CA-in", "explicit").await.unwrap());
        assert!(orch.registry().get(&CallId::parse("CA-in").unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_explicit_cleanup_finalizes_and_evicts() {
        let mut repo = MockCallRepository::new();
        repo.expect_save_call().times(1).returning(|_| Ok(()));
        repo.expect_update_call()
            .withf(|_, patch| {
                patch.termination_reason.as_deref() == Some("explicit:operator")
                    && patch.outcome == Some(CallPhase::Completed)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (orch, _events) = orchestrator(repo, MockTelephonyGateway::new());
        let call_id = CallId::parse("CA2").unwrap();

        let mut metadata = BTreeMap::new();
        metadata.insert(META_SCENARIO.to_string(), "pin".to_string());
        orch.handle_incoming(IncomingCall {
            call_id: "CA2".to_string(),
            metadata,
            ..Default::default()
        })
        .await
        .unwrap();
        let partial = |digits: &str| DtmfInput {
            call_id: "CA2".to_string(),
            digits: digits.to_string(),
            partial: true,
            ..Default::default()
        };
        let buffered = orch.handle_input(partial("1")).await.unwrap();
        assert_eq!(buffered.status, InputStatus::Buffering);

        let handle = orch.registry().get(&call_id).await.unwrap();
        assert_eq!(handle.lock().await.timers.active_count(), 3);

        assert!(orch.cleanup("CA2", "operator").await.unwrap());
        {
            let state = handle.lock().await;
            assert!(state.session.is_cleaned_up());
            assert_eq!(state.session.phase(), CallPhase::Completed);
            assert_eq!(state.timers.active_count(), 0);
        }
        assert!(orch.registry().get(&call_id).await.is_none());

        let err = orch.handle_input(partial("2")).await.unwrap_err();
        assert!(matches!(err, DomainError::SessionNotFound(_)));

        // a released session still in hand never re-arms a timer
        orch.registry().insert(handle.clone()).await;
        let late = orch.handle_input(partial("2")).await.unwrap();
        assert_eq!(late.status, InputStatus::Ignored);
        let mut state = handle.lock().await;
        arm_active_stage(&mut state);
        state.timers.start_deadline(Duration::from_millis(5));
        assert_eq!(state.timers.active_count(), 0);
    }
}
