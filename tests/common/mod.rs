//! Shared wiring for the integration tests

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use dialtone::application::{
    CallOrchestrator, ConversationService, EventPublisher, NotificationPipeline,
    NotificationSettings, OrchestratorSettings, SessionRegistry,
};
use dialtone::domain::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use dialtone::domain::collection::scenario::ScenarioCatalog;
use dialtone::infrastructure::persistence::InMemoryCallRepository;
use dialtone::infrastructure::sandbox::{CannedCompletion, LogMessagingChannel, SandboxTelephony};
use dialtone::interface::api::{build_router, AppState};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt; // For `oneshot`

pub const FALLBACK: &str = "Sorry, I am temporarily unavailable.";

pub struct TestApp {
    pub router: Router,
    pub orchestrator: Arc<CallOrchestrator>,
    pub pipeline: Arc<NotificationPipeline>,
    pub repository: Arc<InMemoryCallRepository>,
    pub telephony: Arc<SandboxTelephony>,
    pub completion: Arc<CannedCompletion>,
    pub messaging: Arc<LogMessagingChannel>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub fn fast_notifications() -> NotificationSettings {
    NotificationSettings {
        default_chat_id: Some("ops-chat".to_string()),
        interval: Duration::from_millis(10),
        inter_message_delay: Duration::ZERO,
        retry_interval: Duration::from_millis(20),
        ..NotificationSettings::default()
    }
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_settings(OrchestratorSettings::default(), fast_notifications())
    }

    /// Provider credentials absent
    pub fn with_unconfigured_telephony() -> Self {
        Self::build(
            OrchestratorSettings::default(),
            fast_notifications(),
            SandboxTelephony::new(false),
            ScenarioCatalog::builtin(),
        )
    }

    pub fn with_settings(settings: OrchestratorSettings, notifications: NotificationSettings) -> Self {
        Self::build(
            settings,
            notifications,
            SandboxTelephony::new(true),
            ScenarioCatalog::builtin(),
        )
    }

    /// Wired with `catalog` in place of the stock scenarios
    pub fn with_catalog(settings: OrchestratorSettings, catalog: ScenarioCatalog) -> Self {
        Self::build(
            settings,
            fast_notifications(),
            SandboxTelephony::new(true),
            catalog,
        )
    }

    fn build(
        settings: OrchestratorSettings,
        notifications: NotificationSettings,
        telephony: SandboxTelephony,
        catalog: ScenarioCatalog,
    ) -> Self {
        let repository = Arc::new(InMemoryCallRepository::new());
        let telephony = Arc::new(telephony);
        let completion = Arc::new(CannedCompletion::new());
        let messaging = Arc::new(LogMessagingChannel::new());

        let breaker = Arc::new(CircuitBreaker::new(
            "completion",
            CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(30),
            },
        ));
        let conversation = Arc::new(ConversationService::new(
            completion.clone(),
            breaker,
            Duration::from_millis(200),
            FALLBACK,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (publisher, events) = EventPublisher::channel(1024);
        let pipeline = Arc::new(NotificationPipeline::new(
            repository.clone(),
            messaging.clone(),
            notifications,
        ));
        let pipeline_task = pipeline.clone().spawn(events, shutdown_rx.clone());

        let (orchestrator, timer_events) = CallOrchestrator::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(catalog),
            repository.clone(),
            telephony.clone(),
            conversation,
            publisher,
            settings,
        );
        let timer_task = orchestrator
            .clone()
            .run_timers(timer_events, shutdown_rx);

        let prometheus_handle = PrometheusBuilder::new().build_recorder().handle();
        let router = build_router(
            AppState {
                orchestrator: orchestrator.clone(),
                pipeline: pipeline.clone(),
            },
            prometheus_handle,
        );

        Self {
            router,
            orchestrator,
            pipeline,
            repository,
            telephony,
            completion,
            messaging,
            shutdown,
            tasks: vec![pipeline_task, timer_task],
        }
    }

    /// POST a form body, returning status and decoded JSON
    pub async fn post_form(&self, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    eventually_within(Duration::from_secs(2), check).await
}

pub async fn eventually_within<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    while started.elapsed() < limit {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
