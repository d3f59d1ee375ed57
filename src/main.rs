//! Tune Manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tune_manager::trainer::PythonTrainerBackend;
use tune_manager::{
    DownloadCoordinator, EnvironmentProber, ModelInventory, Orchestrator, api,
    config::ManagerConfig, metrics, probe,
};

#[derive(Parser, Debug)]
#[command(name = "tune-manager")]
#[command(about = "Local LLM Fine-Tuning Orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting Tune Manager");

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        python_path = %config.python_path,
        trainer_script = ?config.trainer_script,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Resolve the model cache and build the inventory
    let cache_dir = probe::resolve_cache_dir(&config.cache_dir_candidates)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    tracing::info!(cache_dir = ?cache_dir, "Model cache resolved");

    let inventory = Arc::new(ModelInventory::new());
    match inventory.scan(&cache_dir).await {
        Ok(models) => {
            metrics::update_model_count(models.len());
            tracing::info!(count = models.len(), "Model cache scanned");
        }
        Err(e) => tracing::warn!(error = %e, "Initial cache scan failed"),
    }

    // Probe the Python environment once at startup
    let prober = Arc::new(EnvironmentProber::new(
        config.python_path.clone(),
        Duration::from_secs(config.probe_timeout_secs),
    ));
    let env_status = prober.probe(Some(cache_dir.clone())).await;
    tracing::info!(
        readiness = ?env_status.readiness,
        interpreter = ?env_status.interpreter_version,
        ml_runtime = ?env_status.ml_runtime_version,
        "Environment probed"
    );

    // Build the run orchestrator around the Python trainer
    let backend = Arc::new(PythonTrainerBackend::new(
        config.python_path.clone(),
        config.trainer_script.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        backend,
        inventory.clone(),
        Duration::from_secs(config.run_timeout_secs),
        Duration::from_secs(config.graceful_shutdown_timeout_secs),
    ));

    let downloader = Arc::new(DownloadCoordinator::new(
        inventory.clone(),
        cache_dir.clone(),
    ));

    // Setup API
    let app_state = api::AppState {
        inventory,
        orchestrator: orchestrator.clone(),
        prober,
        downloader,
        cache_dir,
        training_defaults: config.training.clone(),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    // Stop any active run so the trainer process does not outlive us
    orchestrator.stop().await;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
