//! Call management API handlers

use super::dto::{ApiResponse, ApiResult, AppState, HealthResponse, SessionListResponse};
use crate::application::orchestrator::{CallLookup, InitiateCall, InitiatedCall};
use crate::domain::call::aggregate::SessionSummary;
use axum::{
    extract::{Path, State},
    Json,
};
use tracing::info;

/// Place an outbound call
pub async fn initiate_call(
    State(state): State<AppState>,
    Json(request): Json<InitiateCall>,
) -> ApiResult<InitiatedCall> {
    info!(destination = ?request.destination, "API: Initiating call");
    let initiated = state.orchestrator.initiate(request).await?;
    Ok(Json(ApiResponse::success(initiated)))
}

/// Get active calls
pub async fn list_calls(State(state): State<AppState>) -> ApiResult<SessionListResponse<SessionSummary>> {
    let calls = state.orchestrator.sessions().await;
    let total = calls.len();
    Ok(Json(ApiResponse::success(SessionListResponse { calls, total })))
}

/// Live session, or the stored record once the session is gone
pub async fn get_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> ApiResult<CallLookup> {
    let lookup = state.orchestrator.lookup(&call_id).await?;
    Ok(Json(ApiResponse::success(lookup)))
}

/// Hangup call
pub async fn hangup_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> ApiResult<SessionSummary> {
    info!("API: Hanging up call ID: {}", call_id);
    let summary = state.orchestrator.hangup(&call_id).await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// Health check
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let breaker = state.orchestrator.conversation().breaker().snapshot();
    let status = match breaker.state {
        crate::domain::circuit_breaker::BreakerState::Closed => "healthy",
        _ => "degraded",
    };
    Json(ApiResponse::success(HealthResponse {
        status: status.to_string(),
        active_sessions: state.orchestrator.registry().len().await,
        tracked_notification_calls: state.pipeline.tracked_calls().await,
        completion_breaker: breaker,
    }))
}
