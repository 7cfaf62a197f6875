use anyhow::{Context, Result};
use publisher_service::api::{start_api_server, AppState};
use publisher_service::config::{BackendKind, Config};
use publisher_service::{
    InMemoryBackend, IntakeStore, Orchestrator, PipelineOptions, RemoteBackend, S3Backend,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Publisher Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let backend = build_backend(&config).await?;

    let intake = IntakeStore::new(&config.intake.directory)
        .await
        .context("Failed to initialize intake directory")?;

    let orchestrator = Orchestrator::new(
        backend.clone(),
        PipelineOptions {
            call_timeout: config.remote_call_timeout(),
            max_concurrent_runs: config.pipeline.max_concurrent_runs,
        },
    );

    let api_state = AppState {
        orchestrator,
        intake,
        backend,
        file_field: config.api.file_field.clone(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Publisher service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down publisher service");

    api_handle.abort();

    info!("Publisher service stopped");

    Ok(())
}

async fn build_backend(config: &Config) -> Result<Arc<dyn RemoteBackend>> {
    match config.backend.kind {
        BackendKind::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .context("Missing [s3] configuration section")?;
            let backend = S3Backend::new(s3)
                .await
                .context("Failed to initialize S3 backend")?;
            Ok(Arc::new(backend))
        }
        BackendKind::Memory => {
            warn!("Using in-memory backend; published objects are lost on restart");
            Ok(Arc::new(InMemoryBackend::new(
                config.backend.memory_base_url.clone(),
            )))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
