//! Trainer process backend: spawning, event parsing, termination
//!
//! The orchestrator never computes anything numeric itself; it launches one
//! external trainer process per run and consumes its stdout as a
//! line-oriented JSON event stream. Each line is one object tagged by
//! `event`:
//!
//! ```text
//! {"event":"loaded"}
//! {"event":"tokenized","records":1024}
//! {"event":"epoch","epoch":1,"loss":2.4311}
//! {"event":"saved"}
//! {"event":"fatal","message":"CUDA out of memory"}
//! ```
//!
//! Lines that do not parse are forwarded verbatim as log events. Process
//! exit is reported separately so a crash without a terminal event is still
//! observed.

use crate::config::TrainingConfig;
use crate::error::{TuneError, TuneResult};
use crate::inventory::ModelArtifact;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};

/// Buffered event channel between the process readers and the run driver
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Trait Definitions
// ============================================================================

/// One observation from the external trainer process
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrainerEvent {
    Loaded,
    Tokenized { records: u64 },
    Epoch { epoch: u32, loss: f64 },
    Saved,
    Log { message: String },
    Fatal { message: String },
    /// Synthesized by the reader when the process exits, never parsed
    #[serde(skip)]
    Exited { code: Option<i32> },
}

/// Parse one stdout line into an event; unparseable lines become log events
pub fn parse_event_line(line: &str) -> TrainerEvent {
    let trimmed = line.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| TrainerEvent::Log {
        message: trimmed.to_string(),
    })
}

/// Handle to a running trainer process
#[async_trait]
pub trait TrainerHandle: Send + Sync {
    /// Graceful termination: SIGTERM, SIGKILL after the grace period
    async fn terminate(&self, grace: Duration);

    async fn pid(&self) -> Option<u32>;
}

/// A launched trainer: its event stream plus a termination handle
pub struct LaunchedTrainer {
    pub events: mpsc::Receiver<TrainerEvent>,
    pub handle: Arc<dyn TrainerHandle>,
}

/// Trait for launching training work against an external ML runtime
#[async_trait]
pub trait TrainerBackend: Send + Sync {
    /// Spawn a training process for one run
    async fn launch(
        &self,
        config: &TrainingConfig,
        model: &ModelArtifact,
        data_file: &Path,
    ) -> TuneResult<LaunchedTrainer>;

    /// Run a single bounded generation against a tuned model
    async fn evaluate(
        &self,
        model: &ModelArtifact,
        prompt: &str,
        timeout: Duration,
    ) -> TuneResult<String>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production backend driving a Python/MLX trainer script
pub struct PythonTrainerBackend {
    python_path: String,
    script: PathBuf,
}

impl PythonTrainerBackend {
    pub fn new(python_path: String, script: PathBuf) -> Self {
        Self {
            python_path,
            script,
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.python_path);
        cmd.arg(&self.script);
        cmd
    }
}

#[async_trait]
impl TrainerBackend for PythonTrainerBackend {
    async fn launch(
        &self,
        config: &TrainingConfig,
        model: &ModelArtifact,
        data_file: &Path,
    ) -> TuneResult<LaunchedTrainer> {
        let mut cmd = self.base_command();
        cmd.arg("--model-path").arg(&model.storage_path);
        cmd.arg("--data").arg(data_file);
        cmd.arg("--output-dir").arg(&config.output_dir);
        cmd.arg("--epochs").arg(config.epochs.to_string());
        cmd.arg("--learning-rate").arg(config.learning_rate.to_string());
        cmd.arg("--batch-size").arg(config.batch_size.to_string());
        cmd.arg("--max-seq-length")
            .arg(config.max_seq_length.to_string());
        if config.verbose_logging {
            cmd.arg("--verbose");
        }
        if config.save_checkpoints {
            cmd.arg("--save-checkpoints");
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TuneError::Process(format!("failed to spawn trainer: {}", e)))?;

        let pid = child.id();
        tracing::info!(
            model = %model.id,
            data = ?data_file,
            epochs = config.epochs,
            pid = ?pid,
            "Trainer process spawned"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TuneError::Process("trainer stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TuneError::Process("trainer stderr not captured".to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = Arc::new(ProcessTrainerHandle {
            pid,
            child: Arc::new(Mutex::new(Some(child))),
        });

        // stderr lines carry diagnostics only; surface them as log events
        let stderr_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(line = %line, "trainer stderr");
                if stderr_tx
                    .send(TrainerEvent::Log { message: line })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // stdout is the event stream; on EOF, reap the process and report
        // its exit status
        let child_slot = handle.child.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(parse_event_line(&line)).await.is_err() {
                    return;
                }
            }

            // stdout closed; if the handle has not reaped the child yet,
            // collect the exit status ourselves
            let child = child_slot.lock().await.take();
            if let Some(mut child) = child {
                let code = child.wait().await.ok().and_then(|status| status.code());
                let _ = tx.send(TrainerEvent::Exited { code }).await;
            }
        });

        Ok(LaunchedTrainer { events: rx, handle })
    }

    async fn evaluate(
        &self,
        model: &ModelArtifact,
        prompt: &str,
        timeout: Duration,
    ) -> TuneResult<String> {
        let mut cmd = self.base_command();
        cmd.arg("--eval");
        cmd.arg("--model-path").arg(&model.storage_path);
        cmd.arg("--prompt").arg(prompt);

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TuneError::Process(format!("failed to spawn evaluator: {}", e)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| TuneError::Process(format!("evaluation timed out after {:?}", timeout)))?
            .map_err(|e| TuneError::Process(format!("failed to collect evaluator output: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TuneError::Process(format!(
                "evaluator exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Handle backed by a real child process
struct ProcessTrainerHandle {
    pid: Option<u32>,
    child: Arc<Mutex<Option<Child>>>,
}

#[async_trait]
impl TrainerHandle for ProcessTrainerHandle {
    async fn terminate(&self, grace: Duration) {
        let child = self.child.lock().await.take();

        let Some(mut child) = child else {
            // Already reaped by the stdout reader
            return;
        };

        if let Some(pid) = child.id() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;

                let pid = Pid::from_raw(pid as i32);
                let _ = kill(pid, Signal::SIGTERM);

                tokio::select! {
                    _ = child.wait() => {
                        tracing::info!("Trainer stopped gracefully");
                    }
                    _ = tokio::time::sleep(grace) => {
                        tracing::warn!("Graceful shutdown timeout, sending SIGKILL");
                        let _ = kill(pid, Signal::SIGKILL);
                        let _ = child.wait().await;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = child.kill().await;
            }
        }
    }

    async fn pid(&self) -> Option<u32> {
        self.pid
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
