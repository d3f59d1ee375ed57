//! API request handlers

use super::models::{HealthResponse, StartRunRequest, TestRequest, TestResponse};
use super::routes::AppState;
use crate::error::{TuneError, TuneResult};
use crate::inventory::{ModelArtifact, model_id_to_cache_name};
use crate::orchestrator::RunSnapshot;
use crate::probe::EnvironmentStatus;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

/// GET /health - Manager health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /environment - Probe the Python/ML runtime environment
pub async fn environment(State(state): State<AppState>) -> Json<EnvironmentStatus> {
    let status = state.prober.probe(Some(state.cache_dir.clone())).await;
    Json(status)
}

/// GET /models - List cached models
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelArtifact>> {
    let models = state.inventory.list().await;

    crate::metrics::update_model_count(models.len());

    Json(models)
}

/// POST /models/rescan - Re-scan the cache directory
pub async fn rescan_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<ModelArtifact>>, TuneError> {
    let models = state.inventory.scan(&state.cache_dir).await?;

    crate::metrics::update_model_count(models.len());
    tracing::info!(count = models.len(), "Cache rescan complete");

    Ok(Json(models))
}

/// POST /models/{owner}/{name}/select - Select a model for fine-tuning
pub async fn select_model(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<ModelArtifact>, TuneError> {
    let id = format!("{}/{}", owner, name);
    let artifact = state.inventory.select(&id).await?;

    tracing::info!(model_id = %id, "Model selected");

    Ok(Json(artifact))
}

/// DELETE /models/selection - Clear the current selection
pub async fn deselect_model(State(state): State<AppState>) -> StatusCode {
    state.inventory.deselect().await;
    StatusCode::NO_CONTENT
}

/// DELETE /models/{owner}/{name} - Delete a cached model
///
/// Idempotent; deleting an unknown id succeeds with no effect.
pub async fn delete_model(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<StatusCode, TuneError> {
    let id = format!("{}/{}", owner, name);

    state.inventory.delete(&id).await;

    let model_dir = state.cache_dir.join(model_id_to_cache_name(&id));
    match tokio::fs::remove_dir_all(&model_dir).await {
        Ok(()) => tracing::info!(model_id = %id, "Model deleted from cache"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(TuneError::Storage(format!(
                "Failed to remove {}: {}",
                model_dir.display(),
                e
            )));
        }
    }

    crate::metrics::update_model_count(state.inventory.count().await);

    Ok(StatusCode::NO_CONTENT)
}

/// POST /models/{owner}/{name}/download - Download and register a model
pub async fn download_model(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<ModelArtifact>), TuneError> {
    let id = format!("{}/{}", owner, name);
    let artifact = state.downloader.download(&id).await?;

    Ok((StatusCode::CREATED, Json(artifact)))
}

/// GET /run - Current run snapshot
pub async fn get_run(State(state): State<AppState>) -> Json<RunSnapshot> {
    Json(state.orchestrator.snapshot().await)
}

/// POST /run/start - Start a fine-tuning run on the selected model
pub async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunSnapshot>), TuneError> {
    let model_id = selected_model_id(&state).await?;
    let data_file = req.data_file.clone();
    let config = req.into_training_config(&state.training_defaults, model_id);

    state.orchestrator.start(config, data_file).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(state.orchestrator.snapshot().await),
    ))
}

/// POST /run/stop - Stop the active run
///
/// Idempotent; stopping with no active run succeeds.
pub async fn stop_run(State(state): State<AppState>) -> Json<RunSnapshot> {
    state.orchestrator.stop().await;
    Json(state.orchestrator.snapshot().await)
}

/// POST /run/test - Generate a response from the fine-tuned model
pub async fn test_run(
    State(state): State<AppState>,
    Json(req): Json<TestRequest>,
) -> Result<Json<TestResponse>, TuneError> {
    let response = state.orchestrator.test_model(&req.prompt).await?;
    Ok(Json(TestResponse { response }))
}

async fn selected_model_id(state: &AppState) -> TuneResult<String> {
    state
        .inventory
        .selected()
        .await
        .map(|artifact| artifact.id)
        .ok_or_else(|| TuneError::Configuration("no model selected".to_string()))
}
