//! API Router configuration

use super::calls_handler::{get_call, hangup_call, health_check, initiate_call, list_calls};
use super::dto::AppState;
use super::metrics_handler::metrics_handler;
use super::webhook_handler::{dtmf_callback, incoming_call, speech_callback, status_callback};
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn build_router(state: AppState, prometheus_handle: PrometheusHandle) -> Router {
    // Health check route
    let health_routes = Router::new().route("/health", get(health_check));

    // Provider webhooks
    let webhook_routes = Router::new()
        .route("/webhooks/incoming-call", post(incoming_call))
        .route("/webhooks/status", post(status_callback))
        .route("/webhooks/dtmf", post(dtmf_callback))
        .route("/webhooks/speech", post(speech_callback));

    // Call management routes
    let call_routes = Router::new()
        .route("/calls", post(initiate_call).get(list_calls))
        .route("/calls/:call_id", get(get_call))
        .route("/calls/:call_id/hangup", post(hangup_call));

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .merge(call_routes)
        .with_state(state)
        .merge(metrics_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
