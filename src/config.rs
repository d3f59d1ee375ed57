//! Configuration structures and loading logic

use crate::error::{TuneError, TuneResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_port: u16,
    /// Python interpreter used for probes and the trainer process
    pub python_path: String,
    /// Trainer entry point handed to the interpreter
    pub trainer_script: PathBuf,
    pub probe_timeout_secs: u64,
    /// Upper bound for a whole run, Loading through Saving
    pub run_timeout_secs: u64,
    pub graceful_shutdown_timeout_secs: u64,
    /// Candidate cache directories, checked in order; the last one is
    /// created if none exist
    pub cache_dir_candidates: Vec<PathBuf>,
    pub training: TrainingConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            python_path: default_python_path(),
            trainer_script: default_trainer_script(),
            probe_timeout_secs: default_probe_timeout(),
            run_timeout_secs: default_run_timeout(),
            graceful_shutdown_timeout_secs: default_graceful_shutdown_timeout(),
            cache_dir_candidates: default_cache_dir_candidates(),
            training: TrainingConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("TUNE_MANAGER_API_PORT") {
            config.api_port = port
                .parse()
                .context("Invalid TUNE_MANAGER_API_PORT value")?;
        }
        if let Ok(python) = std::env::var("TUNE_MANAGER_PYTHON") {
            config.python_path = python;
        }
        if let Ok(script) = std::env::var("TUNE_MANAGER_TRAINER_SCRIPT") {
            config.trainer_script = PathBuf::from(script);
        }
        if let Ok(dir) = std::env::var("TUNE_MANAGER_CACHE_DIR") {
            // An explicit cache dir takes priority over the built-in candidates
            config.cache_dir_candidates.insert(0, PathBuf::from(dir));
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.python_path.is_empty() {
            anyhow::bail!("python_path cannot be empty");
        }
        if self.probe_timeout_secs == 0 {
            anyhow::bail!("probe_timeout_secs must be positive");
        }
        if self.run_timeout_secs == 0 {
            anyhow::bail!("run_timeout_secs must be positive");
        }
        if self.cache_dir_candidates.is_empty() {
            anyhow::bail!("cache_dir_candidates cannot be empty");
        }
        // model_id is not checked here; it comes from the model selection
        // when a run starts
        self.training
            .validate_hyperparameters()
            .map_err(|e| anyhow::anyhow!(e))?;

        Ok(())
    }
}

/// Configuration for a single fine-tuning run
///
/// Captured as an immutable snapshot when a run starts; later edits never
/// affect an active run.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    pub model_id: String,
    pub output_dir: PathBuf,
    pub epochs: u32,
    pub learning_rate: f64,
    pub batch_size: u32,
    pub max_seq_length: u32,
    pub verbose_logging: bool,
    pub save_checkpoints: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            output_dir: PathBuf::from("finetuned-model"),
            epochs: 5,
            learning_rate: 1e-5,
            batch_size: 8,
            max_seq_length: 512,
            verbose_logging: false,
            save_checkpoints: false,
        }
    }
}

impl TrainingConfig {
    /// Check all invariants before a run may start
    pub fn validate(&self) -> TuneResult<()> {
        if self.model_id.is_empty() {
            return Err(TuneError::Configuration("model_id is empty".to_string()));
        }
        self.validate_hyperparameters()
    }

    /// Check every field except `model_id`, which defaults to empty until a
    /// model is selected
    pub fn validate_hyperparameters(&self) -> TuneResult<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(TuneError::Configuration("output_dir is empty".to_string()));
        }
        if self.epochs == 0 {
            return Err(TuneError::Configuration(
                "epochs must be positive".to_string(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TuneError::Configuration(format!(
                "learning_rate must be positive (got {})",
                self.learning_rate
            )));
        }
        if self.batch_size == 0 {
            return Err(TuneError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.max_seq_length == 0 {
            return Err(TuneError::Configuration(
                "max_seq_length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// Default functions
fn default_api_port() -> u16 {
    9100
}
fn default_python_path() -> String {
    "python3".to_string()
}
fn default_trainer_script() -> PathBuf {
    PathBuf::from("trainer/finetune.py")
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_run_timeout() -> u64 {
    3600
}
fn default_graceful_shutdown_timeout() -> u64 {
    10
}

/// Cache locations checked in priority order, matching the layout used by
/// the HuggingFace tooling on Linux and macOS
fn default_cache_dir_candidates() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    vec![
        home.join(".cache/huggingface/hub"),
        home.join("Library/Caches/huggingface/hub"),
        home.join(".cache/huggingface"),
        home.join("Documents/huggingface_cache"),
    ]
}
