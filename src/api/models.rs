//! API request and response models

use crate::config::TrainingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Request to start a fine-tuning run
///
/// The model comes from the current selection; every hyperparameter is
/// optional and falls back to the configured defaults.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunRequest {
    /// Path to the training data file (JSONL)
    pub data_file: PathBuf,

    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    #[serde(default)]
    pub epochs: Option<u32>,

    #[serde(default)]
    pub learning_rate: Option<f64>,

    #[serde(default)]
    pub batch_size: Option<u32>,

    #[serde(default)]
    pub max_seq_length: Option<u32>,

    #[serde(default)]
    pub verbose_logging: Option<bool>,

    #[serde(default)]
    pub save_checkpoints: Option<bool>,
}

impl StartRunRequest {
    /// Merge request overrides onto the configured defaults
    pub fn into_training_config(self, defaults: &TrainingConfig, model_id: String) -> TrainingConfig {
        TrainingConfig {
            model_id,
            output_dir: self.output_dir.unwrap_or_else(|| defaults.output_dir.clone()),
            epochs: self.epochs.unwrap_or(defaults.epochs),
            learning_rate: self.learning_rate.unwrap_or(defaults.learning_rate),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            max_seq_length: self.max_seq_length.unwrap_or(defaults.max_seq_length),
            verbose_logging: self.verbose_logging.unwrap_or(defaults.verbose_logging),
            save_checkpoints: self.save_checkpoints.unwrap_or(defaults.save_checkpoints),
        }
    }
}

/// Request to test a fine-tuned model with a prompt
#[derive(Debug, Serialize, Deserialize)]
pub struct TestRequest {
    pub prompt: String,
}

/// Response to a model test
#[derive(Debug, Serialize, Deserialize)]
pub struct TestResponse {
    pub response: String,
}
