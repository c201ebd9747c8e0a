//! Provider webhook handlers
//!
//! Bodies are form-encoded and accept the provider's field names as aliases.
//! Call type and stage selectors arrive as query parameters.

use super::dto::{ApiResponse, ApiResult, AppState};
use crate::application::orchestrator::{
    CallInstruction, DtmfInput, IncomingCall, SpeechReply, StatusCallback, StatusOutcome,
};
use crate::domain::call::strategy::{
    META_CHAT_ID, META_EXPECTED_CODE, META_GREETING, META_SCENARIO, META_STAGES,
};
use crate::domain::call::value_object::CallType;
use crate::domain::collection::outcome::InputOutcome;
use axum::{
    extract::{Query, State},
    Form, Json,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Selectors carried on the webhook URL
#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    #[serde(rename = "type")]
    pub call_type: Option<String>,
    pub scenario: Option<String>,
    pub stages: Option<String>,
    pub stage: Option<String>,
    pub chat_id: Option<String>,
    pub expected_code: Option<String>,
    pub greeting: Option<String>,
    #[serde(default)]
    pub partial: bool,
    pub event_id: Option<String>,
}

impl WebhookQuery {
    fn metadata(&self) -> BTreeMap<String, String> {
        [
            (META_SCENARIO, &self.scenario),
            (META_STAGES, &self.stages),
            (META_CHAT_ID, &self.chat_id),
            (META_EXPECTED_CODE, &self.expected_code),
            (META_GREETING, &self.greeting),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct IncomingCallForm {
    #[serde(alias = "CallSid")]
    pub call_id: Option<String>,
    #[serde(alias = "From")]
    pub from: Option<String>,
    #[serde(alias = "To")]
    pub to: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusForm {
    #[serde(alias = "CallSid")]
    pub call_id: Option<String>,
    #[serde(alias = "CallStatus")]
    pub status: Option<String>,
    #[serde(alias = "CallDuration")]
    pub duration: Option<u64>,
    #[serde(alias = "ErrorMessage")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DtmfForm {
    #[serde(alias = "CallSid")]
    pub call_id: Option<String>,
    #[serde(alias = "Digits")]
    pub digits: Option<String>,
    #[serde(alias = "EventSid")]
    pub event_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SpeechForm {
    #[serde(alias = "CallSid")]
    pub call_id: Option<String>,
    #[serde(alias = "SpeechResult")]
    pub text: Option<String>,
}

/// Call answered or inbound call arrived
pub async fn incoming_call(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    Form(form): Form<IncomingCallForm>,
) -> ApiResult<CallInstruction> {
    let call_type = query
        .call_type
        .as_deref()
        .map(str::parse::<CallType>)
        .transpose()?;
    let incoming = IncomingCall {
        call_id: form.call_id.unwrap_or_default(),
        call_type,
        from: form.from,
        to: form.to,
        metadata: query.metadata(),
    };
    info!(call_id = %incoming.call_id, "Webhook: incoming call");

    let instruction = state.orchestrator.handle_incoming(incoming).await?;
    Ok(Json(ApiResponse::success(instruction)))
}

/// Provider status change
pub async fn status_callback(
    State(state): State<AppState>,
    Form(form): Form<StatusForm>,
) -> ApiResult<StatusOutcome> {
    let callback = StatusCallback {
        call_id: form.call_id.unwrap_or_default(),
        status: form.status.unwrap_or_default(),
        duration_seconds: form.duration,
        error: form.error,
    };
    debug!(call_id = %callback.call_id, status = %callback.status, "Webhook: status");

    let outcome = state.orchestrator.handle_status(callback).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// Keypad entry, whole or one keystroke at a time
pub async fn dtmf_callback(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    Form(form): Form<DtmfForm>,
) -> ApiResult<InputOutcome> {
    let input = DtmfInput {
        call_id: form.call_id.unwrap_or_default(),
        digits: form.digits.unwrap_or_default(),
        stage_key: query.stage,
        event_id: form.event_id.or(query.event_id),
        partial: query.partial,
    };
    debug!(call_id = %input.call_id, stage = ?input.stage_key, partial = input.partial, "Webhook: dtmf");

    let outcome = state.orchestrator.handle_input(input).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// Caller utterance on a conversational call
pub async fn speech_callback(
    State(state): State<AppState>,
    Form(form): Form<SpeechForm>,
) -> ApiResult<SpeechReply> {
    let call_id = form.call_id.unwrap_or_default();
    let text = form.text.unwrap_or_default();
    debug!(call_id = %call_id, "Webhook: speech");

    let reply = state.orchestrator.handle_speech(&call_id, &text).await?;
    Ok(Json(ApiResponse::success(reply)))
}
