//! API DTOs (Data Transfer Objects) and error mapping

use crate::application::{CallOrchestrator, NotificationPipeline};
use crate::domain::circuit_breaker::CircuitBreakerState;
use crate::domain::shared::error::DomainError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<CallOrchestrator>,
    pub pipeline: Arc<NotificationPipeline>,
}

/// Generic API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Domain error rendered as an [`ApiResponse`]
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(e: DomainError) -> Self {
        Self(e)
    }
}

/// HTTP status for a domain error. An unknown or expired session is
/// acknowledged with 200 so the provider does not keep redelivering the event.
pub fn status_for(error: &DomainError) -> StatusCode {
    match error {
        DomainError::Validation(_) => StatusCode::BAD_REQUEST,
        DomainError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
        DomainError::SessionNotFound(_)
        | DomainError::SessionExpired(_)
        | DomainError::CircuitOpen(_) => StatusCode::OK,
        DomainError::Collaborator { .. } => StatusCode::BAD_GATEWAY,
        DomainError::InvalidStateTransition(_) => StatusCode::CONFLICT,
        DomainError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(kind = self.0.kind(), "API: {}", self.0);
        } else {
            warn!(kind = self.0.kind(), "API: {}", self.0);
        }
        let body = ApiResponse::<()>::error(self.0.to_string());
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub tracked_notification_calls: usize,
    pub completion_breaker: CircuitBreakerState,
}

/// Active session list response
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListResponse<T> {
    pub calls: Vec<T>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::error::Collaborator;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&DomainError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&DomainError::Configuration("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&DomainError::SessionNotFound("CA1".into())),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&DomainError::SessionExpired("CA1".into())),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&DomainError::Collaborator {
                collaborator: Collaborator::Telephony,
                message: "down".into()
            }),
            StatusCode::BAD_GATEWAY
        );
    }
}
