//! Error taxonomy surfaced to callers and API clients

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Errors produced by the orchestrator, inventory, prober and downloader
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("invalid training configuration: {0}")]
    Configuration(String),

    #[error("model '{0}' is not available locally")]
    MissingArtifact(String),

    #[error("training data file error: {0}")]
    DataFile(String),

    #[error("training process error: {0}")]
    Process(String),

    #[error("a training run is already active")]
    AlreadyRunning,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("download of '{id}' failed: {reason}")]
    Download { id: String, reason: String },

    #[error("model '{0}' not found in inventory")]
    NotFound(String),

    #[error("model '{0}' is already registered")]
    Duplicate(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type TuneResult<T> = Result<T, TuneError>;

impl IntoResponse for TuneError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            TuneError::Configuration(_) | TuneError::DataFile(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            TuneError::NotFound(_) | TuneError::MissingArtifact(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            TuneError::AlreadyRunning | TuneError::Duplicate(_) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            TuneError::Download { .. } => (StatusCode::BAD_GATEWAY, self.to_string()),
            TuneError::Process(_) | TuneError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            TuneError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
