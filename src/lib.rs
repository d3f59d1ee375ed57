//! Tune Manager - Local fine-tuning job orchestrator
//!
//! A lightweight Rust service that manages LLM fine-tuning runs executed by
//! a Python trainer process, with a model cache inventory and environment
//! probing over a REST API.

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod inventory;
pub mod metrics;
pub mod orchestrator;
pub mod probe;
pub mod trainer;

pub use config::{ManagerConfig, TrainingConfig};
pub use download::{DownloadCoordinator, HubFetcher};
pub use error::{TuneError, TuneResult};
pub use inventory::{ModelArtifact, ModelInventory};
pub use orchestrator::{Orchestrator, RunSnapshot, RunStatus};
pub use probe::{EnvironmentProber, EnvironmentStatus, Readiness};
pub use trainer::{TrainerBackend, TrainerEvent};
