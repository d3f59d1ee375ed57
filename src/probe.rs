//! Environment probing: interpreter and ML runtime checks, cache resolution
//!
//! Probes are short-lived external commands with a bounded wait. A timeout
//! counts as probe failure, never as a hang; failure of one probe does not
//! block the other.

use crate::error::{TuneError, TuneResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Captured output of a bounded external command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Trait for running short-lived external commands with a deadline
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration)
    -> Result<CommandOutput>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production command runner using tokio::process
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", program))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("'{}' timed out after {:?}", program, timeout))?
            .with_context(|| format!("Failed to collect output of '{}'", program))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ============================================================================
// Environment Status
// ============================================================================

/// Derived readiness of the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Degraded,
    NotReady,
}

/// Result of probing the host for training prerequisites
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStatus {
    pub interpreter_available: bool,
    /// Parsed interpreter version, e.g. "3.11.9"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter_version: Option<String>,
    pub ml_runtime_available: bool,
    /// Parsed ML runtime version, e.g. "0.15.2"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_runtime_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_directory: Option<PathBuf>,
    pub readiness: Readiness,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

impl EnvironmentStatus {
    fn derive_readiness(
        interpreter: bool,
        ml_runtime: bool,
        cache_directory: &Option<PathBuf>,
    ) -> Readiness {
        match (interpreter && ml_runtime, cache_directory.is_some()) {
            (true, true) => Readiness::Ready,
            (true, false) => Readiness::Degraded,
            (false, _) => Readiness::NotReady,
        }
    }
}

// ============================================================================
// Environment Prober
// ============================================================================

/// Probes the host environment for the Python interpreter and MLX runtime
pub struct EnvironmentProber {
    python_path: String,
    timeout: Duration,
    runner: std::sync::Arc<dyn CommandRunner>,
}

impl EnvironmentProber {
    /// Create a prober with a custom command runner
    pub fn new_with_runner(
        python_path: String,
        timeout: Duration,
        runner: std::sync::Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            python_path,
            timeout,
            runner,
        }
    }

    /// Create a prober using the system command runner
    pub fn new(python_path: String, timeout: Duration) -> Self {
        Self::new_with_runner(
            python_path,
            timeout,
            std::sync::Arc::new(SystemCommandRunner::new()),
        )
    }

    /// Run both probes and report a complete status
    ///
    /// Both checks complete (or time out) before the status is built; a
    /// partially probed status is never surfaced.
    pub async fn probe(&self, cache_directory: Option<PathBuf>) -> EnvironmentStatus {
        let (interpreter, ml_runtime) =
            tokio::join!(self.check_interpreter(), self.check_ml_runtime());

        let readiness = EnvironmentStatus::derive_readiness(
            interpreter.is_some(),
            ml_runtime.is_some(),
            &cache_directory,
        );

        EnvironmentStatus {
            interpreter_available: interpreter.is_some(),
            interpreter_version: interpreter,
            ml_runtime_available: ml_runtime.is_some(),
            ml_runtime_version: ml_runtime,
            cache_directory,
            readiness,
            checked_at: chrono::Utc::now(),
        }
    }

    /// `python3 --version` with a bounded wait; returns the parsed version
    async fn check_interpreter(&self) -> Option<String> {
        match self
            .runner
            .run(&self.python_path, &["--version"], self.timeout)
            .await
        {
            Ok(out) if out.success => {
                let version = parse_python_version(&out.stdout, &out.stderr);
                tracing::debug!(version = ?version, "Interpreter probe succeeded");
                version.or_else(|| Some("unknown".to_string()))
            }
            Ok(out) => {
                tracing::warn!(stderr = %out.stderr.trim(), "Interpreter probe failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Interpreter probe failed");
                None
            }
        }
    }

    /// `python3 -c "import mlx; print(mlx.__version__)"` with a bounded wait
    async fn check_ml_runtime(&self) -> Option<String> {
        match self
            .runner
            .run(
                &self.python_path,
                &["-c", "import mlx; print(mlx.__version__)"],
                self.timeout,
            )
            .await
        {
            Ok(out) if out.success => {
                let version = out.stdout.trim();
                if version.is_empty() {
                    None
                } else {
                    tracing::debug!(version = %version, "ML runtime probe succeeded");
                    Some(version.to_string())
                }
            }
            Ok(out) => {
                tracing::warn!(stderr = %out.stderr.trim(), "ML runtime probe failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "ML runtime probe failed");
                None
            }
        }
    }
}

/// Extract "X.Y.Z" from "Python X.Y.Z"
///
/// Old interpreters print the banner on stderr, so both streams are checked.
fn parse_python_version(stdout: &str, stderr: &str) -> Option<String> {
    for payload in [stdout, stderr] {
        if let Some(rest) = payload.trim().strip_prefix("Python ") {
            let version = rest.split_whitespace().next()?;
            return Some(version.to_string());
        }
    }
    None
}

/// Resolve the cache directory from an ordered candidate list
///
/// Returns the first candidate that exists. If none exist, creates the last
/// candidate (with intermediate directories) and returns it. Creation failure
/// is a `StorageError`, never silently swallowed.
pub fn resolve_cache_dir(candidates: &[PathBuf]) -> TuneResult<PathBuf> {
    for candidate in candidates {
        if candidate.exists() {
            tracing::debug!(path = ?candidate, "Using existing cache directory");
            return Ok(candidate.clone());
        }
    }

    let default = candidates
        .last()
        .ok_or_else(|| TuneError::Storage("no cache directory candidates".to_string()))?;

    std::fs::create_dir_all(default).map_err(|e| {
        TuneError::Storage(format!(
            "failed to create cache directory {:?}: {}",
            default, e
        ))
    })?;

    tracing::info!(path = ?default, "Created cache directory");
    Ok(default.clone())
}

/// Check that a path is a readable regular file
pub async fn check_data_file(path: &Path) -> TuneResult<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| TuneError::DataFile(format!("{:?}: {}", path, e)))?;

    if !meta.is_file() {
        return Err(TuneError::DataFile(format!("{:?} is not a file", path)));
    }

    Ok(())
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
