//! API route definitions

use crate::config::TrainingConfig;
use crate::download::DownloadCoordinator;
use crate::inventory::ModelInventory;
use crate::orchestrator::Orchestrator;
use crate::probe::EnvironmentProber;
use axum::{
    Router,
    routing::{delete, get, post},
};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub inventory: Arc<ModelInventory>,
    pub orchestrator: Arc<Orchestrator>,
    pub prober: Arc<EnvironmentProber>,
    pub downloader: Arc<DownloadCoordinator>,
    pub cache_dir: PathBuf,
    pub training_defaults: TrainingConfig,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/environment", get(handlers::environment))
        // Model inventory (ids are owner/name repo ids, captured as two segments)
        .route("/models", get(handlers::list_models))
        .route("/models/rescan", post(handlers::rescan_models))
        .route("/models/selection", delete(handlers::deselect_model))
        .route("/models/{owner}/{name}", delete(handlers::delete_model))
        .route("/models/{owner}/{name}/select", post(handlers::select_model))
        .route(
            "/models/{owner}/{name}/download",
            post(handlers::download_model),
        )
        // Run lifecycle
        .route("/run", get(handlers::get_run))
        .route("/run/start", post(handlers::start_run))
        .route("/run/stop", post(handlers::stop_run))
        .route("/run/test", post(handlers::test_run))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
