// Main entry point - Dependency injection, scheduler and server setup
mod application;
mod domain;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::ingest_service::IngestService;
use crate::application::power_repository::PowerRepository;
use crate::application::report_service::ReportService;
use crate::application::scheduler::TickScheduler;
use crate::application::telemetry_source::TelemetryCollector;
use crate::infrastructure::config::load_power_config;
use crate::infrastructure::shelly_source::ShellySource;
use crate::infrastructure::snapshot_repository::SnapshotRepository;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    health_check, hour_history, ingest_sample, ingest_shelly_event, latest_summary, list_devices,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = load_power_config()?;

    // Create repository (infrastructure layer)
    let repository: Arc<dyn PowerRepository> = match &config.storage.snapshot_path {
        Some(path) => Arc::new(
            SnapshotRepository::open(path, config.storage.compact_after_entries).await?,
        ),
        None => {
            tracing::warn!("No snapshot path configured, summaries will not survive a restart");
            Arc::new(SnapshotRepository::in_memory())
        }
    };
    for device in &config.devices {
        repository.register_device(&device.id).await?;
    }

    // Create services (application layer)
    let ingest_service =
        IngestService::new(repository.clone(), config.scheduler.status_threshold_watts);
    let report_service = ReportService::new(repository.clone());

    let collector = if config.telemetry.enabled && !config.devices.is_empty() {
        let source = ShellySource::new(&config.devices, config.telemetry.request_timeout())?;
        Some(TelemetryCollector::new(Arc::new(source), ingest_service.clone()))
    } else {
        None
    };

    // Start the aggregation loop
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let scheduler = TickScheduler::new(repository.clone(), collector);
    let poll_interval = config.scheduler.poll_interval();
    let scheduler_task = tokio::spawn(scheduler.run(poll_interval, async move {
        let _ = shutdown_rx.await;
    }));

    // Create application state
    let state = Arc::new(AppState {
        ingest_service,
        report_service,
        mains_voltage: config.telemetry.mains_voltage,
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/devices", get(list_devices))
        .route("/devices/:id/latest", get(latest_summary))
        .route("/devices/:id/history/hourly", get(hour_history))
        .route("/samples", post(ingest_sample))
        .route("/shelly/events", post(ingest_shelly_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = config.server.bind_addr.parse()?;
    tracing::info!(%addr, "Starting power-rollup service");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let _ = shutdown_tx.send(());
    scheduler_task.await?;

    Ok(())
}
