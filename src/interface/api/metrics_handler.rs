//! Prometheus metrics handler

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics exporter
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_gauge!("call_sessions_active", "Number of live call sessions");
    describe_counter!("calls_initiated_total", "Outbound calls placed");
    describe_counter!("calls_accepted_total", "Calls answered or received");
    describe_counter!("calls_finalized_total", "Sessions finalized, by outcome");
    describe_counter!("input_attempts_total", "Keypad entries evaluated, by verdict");
    describe_counter!("input_redeliveries_total", "Keypad callbacks recognized as redelivered");
    describe_counter!("stage_timeouts_total", "Stages that timed out waiting for input");
    describe_counter!("call_deadlines_total", "Sessions ended by the max call duration");
    describe_counter!("collaborator_errors_total", "Collaborator failures, by operation");
    describe_counter!("events_dropped_total", "Events for unknown or finished sessions");
    describe_counter!(
        "status_callbacks_ignored_total",
        "Status callbacks ignored as duplicate or late"
    );
    describe_counter!("completion_turns_total", "Conversational turns, by result");
    describe_counter!("notifications_queued_total", "Notifications queued");
    describe_counter!("notifications_sent_total", "Notifications delivered");
    describe_counter!("notifications_retried_total", "Notification deliveries scheduled for retry");
    describe_counter!("notifications_failed_total", "Notifications that exhausted their retries");
    describe_counter!(
        "notifications_suppressed_total",
        "Notifications dropped by the ordering gate"
    );
    describe_counter!("breaker_short_circuits_total", "Calls rejected by an open breaker");
    describe_counter!("breaker_failures_total", "Failures recorded by a breaker");
    describe_counter!("breaker_transitions_total", "Breaker state changes");
}

/// HTTP metrics handler
pub async fn metrics_handler(
    axum::extract::State(prometheus_handle): axum::extract::State<PrometheusHandle>,
) -> Response {
    let metrics = prometheus_handle.render();
    (StatusCode::OK, metrics).into_response()
}
