use dialtone::application::{
    CallOrchestrator, ConversationService, EventPublisher, NotificationPipeline, SessionRegistry,
};
use dialtone::config::AppConfig;
use dialtone::domain::call::repository::CallRepository;
use dialtone::domain::circuit_breaker::CircuitBreaker;
use dialtone::infrastructure::persistence::InMemoryCallRepository;
use dialtone::infrastructure::sandbox::{CannedCompletion, LogMessagingChannel, SandboxTelephony};
use dialtone::interface::api::{build_router, init_metrics, AppState};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "postgres")]
use dialtone::infrastructure::persistence::{create_pool, run_migrations, PgCallRepository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting dialtone");

    let catalog = Arc::new(config.scenario_catalog()?);
    info!(scenarios = ?catalog.names(), "Scenario catalog loaded");

    let repository = build_repository(&config).await?;

    if !config.telephony.is_configured() {
        warn!("Telephony credentials not configured, outbound calls will be rejected");
    }
    let telephony = Arc::new(SandboxTelephony::new(config.telephony.is_configured()));

    let breaker = Arc::new(CircuitBreaker::new("completion", config.breaker_config()));
    let conversation = Arc::new(ConversationService::new(
        Arc::new(CannedCompletion::new()),
        breaker,
        config.completion_timeout(),
        config.breaker.fallback_response.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (publisher, events) = EventPublisher::channel(config.notifications.queue_capacity);
    let pipeline = Arc::new(NotificationPipeline::new(
        repository.clone(),
        Arc::new(LogMessagingChannel::new()),
        config.notification_settings(),
    ));
    let pipeline_handle = pipeline.clone().spawn(events, shutdown_rx.clone());

    let (orchestrator, timer_events) = CallOrchestrator::new(
        Arc::new(SessionRegistry::new()),
        catalog,
        repository,
        telephony,
        conversation,
        publisher,
        config.orchestrator_settings(),
    );
    let timer_handle = orchestrator
        .clone()
        .run_timers(timer_events, shutdown_rx.clone());

    // Initialize metrics exporter
    info!("Initializing Prometheus metrics exporter");
    let prometheus_handle = init_metrics()?;

    let state = AppState {
        orchestrator,
        pipeline,
    };
    let app = build_router(state, prometheus_handle);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("REST API server started on {}", addr);

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    server.await??;
    let _ = timer_handle.await;
    let _ = pipeline_handle.await;
    info!("Shutdown complete");

    Ok(())
}

async fn build_repository(config: &AppConfig) -> anyhow::Result<Arc<dyn CallRepository>> {
    #[cfg(feature = "postgres")]
    {
        if let Some(db_config) = config.database_config() {
            let pool = create_pool(&db_config).await?;
            if config.database.run_migrations {
                run_migrations(&pool).await?;
            }
            info!("Using PostgreSQL call repository");
            return Ok(Arc::new(PgCallRepository::new(pool)));
        }
    }

    if config.database.url.is_some() {
        warn!("Database URL set but built without the postgres feature");
    }
    info!("Using in-memory call repository");
    Ok(Arc::new(InMemoryCallRepository::new()))
}
