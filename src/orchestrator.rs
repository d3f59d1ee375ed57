//! Fine-tuning run lifecycle: the single-run state machine
//!
//! One run at a time. The driver task is the only writer of run state while
//! a run is active; `stop()` takes over only after signalling the driver and
//! waiting for it to exit. All readers get immutable snapshots.

use crate::config::TrainingConfig;
use crate::error::{TuneError, TuneResult};
use crate::inventory::ModelInventory;
use crate::probe::check_data_file;
use crate::trainer::{TrainerBackend, TrainerEvent, TrainerHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;

/// Rolling log keeps only the most recent entries
pub const RUN_LOG_CAPACITY: usize = 20;

/// Bounded wait for a model test generation
const EVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Lifecycle stage of the current (or last) run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Loading,
    Tokenizing,
    Training,
    Saving,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    /// True while a run owns the state machine
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Loading | RunStatus::Tokenizing | RunStatus::Training | RunStatus::Saving
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Tokenizing => "tokenizing",
            Self::Training => "training",
            Self::Saving => "saving",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One timestamped run log line
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Live run state, owned by the orchestrator
struct RunState {
    status: RunStatus,
    config: Option<TrainingConfig>,
    current_epoch: u32,
    current_loss: f64,
    progress: f64,
    log: VecDeque<LogEntry>,
    error: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            status: RunStatus::Idle,
            config: None,
            current_epoch: 0,
            current_loss: 0.0,
            progress: 0.0,
            log: VecDeque::with_capacity(RUN_LOG_CAPACITY),
            error: None,
        }
    }

    /// Append a log entry, evicting the oldest when full
    fn push_log(&mut self, message: impl Into<String>) {
        if self.log.len() == RUN_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    fn fail(&mut self, reason: String) {
        tracing::error!(reason = %reason, "Training run failed");
        self.status = RunStatus::Failed;
        self.push_log(format!("Training failed: {}", reason));
        self.error = Some(reason);
        crate::metrics::record_run_failed();
    }
}

/// Immutable view of the run state handed to all readers
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub current_epoch: u32,
    pub total_epochs: u32,
    pub current_loss: f64,
    pub progress: f64,
    pub log: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ActiveRun {
    handle: Arc<dyn TrainerHandle>,
    stop_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

/// Orchestrates the lifecycle of one fine-tuning run at a time
pub struct Orchestrator {
    state: Arc<RwLock<RunState>>,
    backend: Arc<dyn TrainerBackend>,
    inventory: Arc<ModelInventory>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    run_timeout: Duration,
    grace: Duration,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn TrainerBackend>,
        inventory: Arc<ModelInventory>,
        run_timeout: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(RunState::new())),
            backend,
            inventory,
            active: Arc::new(Mutex::new(None)),
            run_timeout,
            grace,
        }
    }

    /// Start a run
    ///
    /// All rejections happen before any state is touched: invalid config,
    /// missing artifact, unreadable data file, then an already-active run.
    /// Returns as soon as the driver task is spawned; stage completion is
    /// observed through snapshots.
    pub async fn start(&self, config: TrainingConfig, data_file: PathBuf) -> TuneResult<()> {
        config.validate()?;

        let model = self
            .inventory
            .get(&config.model_id)
            .await
            .filter(|artifact| artifact.downloaded)
            .ok_or_else(|| TuneError::MissingArtifact(config.model_id.clone()))?;

        check_data_file(&data_file).await?;

        // Hold the active slot through launch so two concurrent start()
        // calls cannot both spawn a trainer
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(TuneError::AlreadyRunning);
        }

        let data_name = data_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| data_file.display().to_string());

        {
            let mut state = self.state.write().await;
            *state = RunState::new();
            state.status = RunStatus::Loading;
            state.config = Some(config.clone());
            state.push_log("Loading model and tokenizer...");
            state.push_log(format!("Loading data from {}", data_name));
        }

        let launched = match self.backend.launch(&config, &model, &data_file).await {
            Ok(launched) => launched,
            Err(e) => {
                let mut state = self.state.write().await;
                state.fail(e.to_string());
                return Err(e);
            }
        };

        tracing::info!(
            model = %config.model_id,
            epochs = config.epochs,
            data = %data_name,
            "Training run started"
        );
        crate::metrics::record_run_started(&config.model_id);

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = tokio::spawn(drive_run(
            self.state.clone(),
            self.active.clone(),
            launched.events,
            stop_rx,
            config.epochs,
            self.run_timeout,
            self.grace,
        ));

        *active = Some(ActiveRun {
            handle: launched.handle,
            stop_tx,
            driver,
        });

        Ok(())
    }

    /// Stop the active run
    ///
    /// Idempotent and safe from any state; calling with no active run is a
    /// no-op. Terminates the trainer process and appends a final log entry;
    /// nothing mutates run state afterwards.
    pub async fn stop(&self) {
        let run = self.active.lock().await.take();

        let Some(run) = run else {
            return;
        };

        // Signal the driver and wait for it to exit before touching state,
        // so exactly one writer exists at any time
        let _ = run.stop_tx.send(true);
        let _ = run.driver.await;

        {
            let mut state = self.state.write().await;
            // The driver may have reached a terminal state before seeing
            // the signal; only an active run transitions to Stopped
            if state.status.is_active() {
                state.status = RunStatus::Stopped;
                state.push_log("Training stopped by user");
                crate::metrics::record_run_stopped();
            }
        }

        run.handle.terminate(self.grace).await;
        tracing::info!("Training run stopped");
    }

    /// Run a bounded generation against the selected model
    ///
    /// Rejected while a run is active; the trainer process owns the runtime.
    pub async fn test_model(&self, prompt: &str) -> TuneResult<String> {
        if self.active.lock().await.is_some() {
            return Err(TuneError::AlreadyRunning);
        }

        let model = self
            .inventory
            .selected()
            .await
            .ok_or_else(|| TuneError::Configuration("no model selected".to_string()))?;

        {
            let mut state = self.state.write().await;
            state.push_log("Testing fine-tuned model...");
        }

        let response = self.backend.evaluate(&model, prompt, EVAL_TIMEOUT).await?;

        let mut state = self.state.write().await;
        state.push_log(format!("Model response: {}", response));
        state.push_log("Model test completed");

        Ok(response)
    }

    /// Immutable copy of the current run state
    pub async fn snapshot(&self) -> RunSnapshot {
        let state = self.state.read().await;
        RunSnapshot {
            status: state.status,
            current_epoch: state.current_epoch,
            total_epochs: state.config.as_ref().map(|c| c.epochs).unwrap_or(0),
            current_loss: state.current_loss,
            progress: state.progress,
            log: state.log.iter().cloned().collect(),
            error: state.error.clone(),
        }
    }

    /// True while a run is active
    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

/// Consume trainer events and advance the state machine
///
/// Exits on a terminal event, on stream end, on timeout, or when stopped.
/// On the stop path it returns immediately without mutating state; `stop()`
/// records the terminal Stopped state itself.
async fn drive_run(
    state: Arc<RwLock<RunState>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    mut events: mpsc::Receiver<TrainerEvent>,
    mut stop_rx: watch::Receiver<bool>,
    total_epochs: u32,
    run_timeout: Duration,
    grace: Duration,
) {
    let deadline = tokio::time::Instant::now() + run_timeout;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                state.write().await.fail(format!(
                    "run exceeded timeout of {}s",
                    run_timeout.as_secs()
                ));
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if apply_event(&state, event, total_epochs).await {
                            break;
                        }
                    }
                    None => {
                        let mut state = state.write().await;
                        if state.status.is_active() {
                            state.fail("trainer output stream ended unexpectedly".to_string());
                        }
                        break;
                    }
                }
            }
        }
    }

    // Terminal state reached through events or timeout; release the active
    // slot so a new run may start, and make sure the trainer process is
    // gone (a no-op when it already exited cleanly). Dropping our own
    // JoinHandle here only detaches it.
    let run = active.lock().await.take();
    if let Some(run) = run {
        run.handle.terminate(grace).await;
    }
}

/// Apply one event; returns true when the run reached a terminal state
async fn apply_event(
    state: &Arc<RwLock<RunState>>,
    event: TrainerEvent,
    total_epochs: u32,
) -> bool {
    let mut state = state.write().await;

    match event {
        TrainerEvent::Loaded => {
            state.status = RunStatus::Tokenizing;
            state.push_log("Tokenizing data...");
            false
        }
        TrainerEvent::Tokenized { records } => {
            state.status = RunStatus::Training;
            state.push_log(format!("Starting training on {} records...", records));
            false
        }
        TrainerEvent::Epoch { epoch, loss } => {
            state.current_epoch = epoch;
            state.current_loss = loss;
            // Progress never regresses within a run, even if the trainer
            // re-reports an epoch
            let progress = f64::from(epoch) / f64::from(total_epochs.max(1));
            state.progress = state.progress.max(progress.min(1.0));
            state.push_log(format!("Epoch {} finished with loss {:.4}", epoch, loss));

            if epoch >= total_epochs {
                state.status = RunStatus::Saving;
                state.push_log("Saving fine-tuned model...");
            }
            false
        }
        TrainerEvent::Saved => {
            state.status = RunStatus::Completed;
            state.progress = 1.0;
            state.push_log("Training completed successfully");
            crate::metrics::record_run_completed();
            tracing::info!("Training run completed");
            true
        }
        TrainerEvent::Log { message } => {
            state.push_log(message);
            false
        }
        TrainerEvent::Fatal { message } => {
            state.fail(message);
            true
        }
        TrainerEvent::Exited { code } => {
            match code {
                // A clean exit during Saving counts as completion even if
                // the saved event was lost with the tail of the stream
                Some(0) if state.status == RunStatus::Saving => {
                    state.status = RunStatus::Completed;
                    state.progress = 1.0;
                    state.push_log("Training completed successfully");
                    crate::metrics::record_run_completed();
                }
                Some(0) if !state.status.is_active() => {}
                Some(0) => {
                    state.fail("trainer exited before completing".to_string());
                }
                code => {
                    state.fail(format!(
                        "training process exited with status {}",
                        code.map(|c| c.to_string())
                            .unwrap_or_else(|| "unknown (killed by signal)".to_string())
                    ));
                }
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ModelArtifact;
    use crate::trainer::mocks::MockTrainerBackend;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Fixture {
        orchestrator: Orchestrator,
        backend: Arc<MockTrainerBackend>,
        inventory: Arc<ModelInventory>,
        data_file: PathBuf,
        _temp: TempDir,
    }

    async fn fixture(script: Vec<TrainerEvent>) -> Fixture {
        let temp = TempDir::new().unwrap();
        let data_file = temp.path().join("data.jsonl");
        std::fs::write(
            &data_file,
            r#"{"instruction":"greet","input":"","output":"hi"}"#,
        )
        .unwrap();

        let inventory = Arc::new(ModelInventory::new());
        inventory
            .register(ModelArtifact {
                id: "org/model".to_string(),
                display_name: "model".to_string(),
                size_bytes: 1024,
                storage_path: temp.path().join("model"),
                downloaded: true,
            })
            .await
            .unwrap();

        let backend = Arc::new(MockTrainerBackend::new(script));
        let orchestrator = Orchestrator::new(
            backend.clone(),
            inventory.clone(),
            Duration::from_secs(30),
            Duration::from_millis(50),
        );

        Fixture {
            orchestrator,
            backend,
            inventory,
            data_file,
            _temp: temp,
        }
    }

    fn config(epochs: u32) -> TrainingConfig {
        TrainingConfig {
            model_id: "org/model".to_string(),
            epochs,
            ..Default::default()
        }
    }

    async fn wait_terminal(orchestrator: &Orchestrator) -> RunSnapshot {
        for _ in 0..200 {
            let snapshot = orchestrator.snapshot().await;
            if !snapshot.status.is_active() && snapshot.status != RunStatus::Idle {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_successful_run_emits_n_epochs() {
        let epochs = 3;
        let f = fixture(MockTrainerBackend::successful_run(epochs)).await;

        f.orchestrator
            .start(config(epochs), f.data_file.clone())
            .await
            .unwrap();

        let snapshot = wait_terminal(&f.orchestrator).await;
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.progress, 1.0);
        assert_eq!(snapshot.current_epoch, epochs);

        let epoch_entries = snapshot
            .log
            .iter()
            .filter(|e| e.message.starts_with("Epoch "))
            .count();
        assert_eq!(epoch_entries, epochs as usize);

        // Active slot released; a new run may start
        assert!(!f.orchestrator.is_running().await);
    }

    #[tokio::test]
    async fn test_stage_transitions() {
        let f = fixture(vec![TrainerEvent::Loaded]).await;
        f.backend.hold_open.store(true, Ordering::SeqCst);

        f.orchestrator
            .start(config(2), f.data_file.clone())
            .await
            .unwrap();

        // Starts in Loading, moves to Tokenizing on the loaded event
        for _ in 0..100 {
            if f.orchestrator.snapshot().await.status == RunStatus::Tokenizing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            f.orchestrator.snapshot().await.status,
            RunStatus::Tokenizing
        );

        f.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let f = fixture(vec![]).await;
        let bad = TrainingConfig {
            model_id: "org/model".to_string(),
            epochs: 0,
            ..Default::default()
        };

        let err = f
            .orchestrator
            .start(bad, f.data_file.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::Configuration(_)));
        // No state transition happened
        assert_eq!(f.orchestrator.snapshot().await.status, RunStatus::Idle);
        assert_eq!(f.backend.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_model() {
        let f = fixture(vec![]).await;
        let cfg = TrainingConfig {
            model_id: "missing/model".to_string(),
            ..Default::default()
        };

        let err = f
            .orchestrator
            .start(cfg, f.data_file.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::MissingArtifact(_)));
        assert_eq!(f.orchestrator.snapshot().await.status, RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_start_rejects_undownloaded_model() {
        let f = fixture(vec![]).await;
        f.inventory
            .register(ModelArtifact {
                id: "org/pending".to_string(),
                display_name: "pending".to_string(),
                size_bytes: 0,
                storage_path: PathBuf::from("/tmp/pending"),
                downloaded: false,
            })
            .await
            .unwrap();

        let cfg = TrainingConfig {
            model_id: "org/pending".to_string(),
            ..Default::default()
        };
        let err = f
            .orchestrator
            .start(cfg, f.data_file.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::MissingArtifact(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_missing_data_file() {
        let f = fixture(vec![]).await;

        let err = f
            .orchestrator
            .start(config(2), PathBuf::from("/nonexistent/data.jsonl"))
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::DataFile(_)));
        assert_eq!(f.orchestrator.snapshot().await.status, RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_start_while_running_rejected() {
        // No terminal event keeps the run active
        let f = fixture(vec![TrainerEvent::Loaded]).await;
        f.backend.hold_open.store(true, Ordering::SeqCst);

        f.orchestrator
            .start(config(5), f.data_file.clone())
            .await
            .unwrap();

        let before = f.orchestrator.snapshot().await;
        let err = f
            .orchestrator
            .start(config(5), f.data_file.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::AlreadyRunning));

        // The active run's state is untouched
        let after = f.orchestrator.snapshot().await;
        assert_eq!(after.current_epoch, before.current_epoch);
        assert_eq!(f.backend.launches.load(Ordering::SeqCst), 1);

        f.orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_stop_mid_training() {
        let mut script = vec![
            TrainerEvent::Loaded,
            TrainerEvent::Tokenized { records: 10 },
            TrainerEvent::Epoch {
                epoch: 1,
                loss: 2.5,
            },
        ];
        // Events that must never be applied after stop
        script.push(TrainerEvent::Epoch {
            epoch: 2,
            loss: 2.0,
        });
        let f = fixture(script).await;
        f.backend.hold_open.store(true, Ordering::SeqCst);

        f.orchestrator
            .start(config(10), f.data_file.clone())
            .await
            .unwrap();

        // Wait for the first epoch tick, then stop
        for _ in 0..100 {
            if f.orchestrator.snapshot().await.current_epoch >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.orchestrator.stop().await;

        let snapshot = f.orchestrator.snapshot().await;
        assert_eq!(snapshot.status, RunStatus::Stopped);
        let epoch_at_stop = snapshot.current_epoch;
        assert!(epoch_at_stop < 10);

        // No further ticks arrive after Stopped is recorded
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = f.orchestrator.snapshot().await;
        assert_eq!(later.status, RunStatus::Stopped);
        assert_eq!(later.current_epoch, epoch_at_stop);
        assert!(
            later
                .log
                .iter()
                .any(|e| e.message == "Training stopped by user")
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let f = fixture(vec![]).await;

        // Safe from Idle
        f.orchestrator.stop().await;
        assert_eq!(f.orchestrator.snapshot().await.status, RunStatus::Idle);

        // Safe after a terminal state, repeatedly
        f.orchestrator
            .start(config(1), f.data_file.clone())
            .await
            .unwrap(); // empty script -> stream ends -> Failed
        let snapshot = wait_terminal(&f.orchestrator).await;
        assert_eq!(snapshot.status, RunStatus::Failed);
        f.orchestrator.stop().await;
        f.orchestrator.stop().await;
        assert_eq!(f.orchestrator.snapshot().await.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_fatal_event_fails_run() {
        let f = fixture(vec![
            TrainerEvent::Loaded,
            TrainerEvent::Fatal {
                message: "CUDA out of memory".to_string(),
            },
        ])
        .await;

        f.orchestrator
            .start(config(3), f.data_file.clone())
            .await
            .unwrap();

        let snapshot = wait_terminal(&f.orchestrator).await;
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("CUDA out of memory"));
        // The failed run stays inspectable
        assert!(
            snapshot
                .log
                .iter()
                .any(|e| e.message.contains("CUDA out of memory"))
        );
        assert!(!f.orchestrator.is_running().await);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_run() {
        let f = fixture(vec![
            TrainerEvent::Loaded,
            TrainerEvent::Exited { code: Some(137) },
        ])
        .await;

        f.orchestrator
            .start(config(3), f.data_file.clone())
            .await
            .unwrap();

        let snapshot = wait_terminal(&f.orchestrator).await;
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.error.unwrap().contains("137"));
    }

    #[tokio::test]
    async fn test_stream_end_without_terminal_fails_run() {
        let f = fixture(vec![TrainerEvent::Loaded]).await;

        f.orchestrator
            .start(config(3), f.data_file.clone())
            .await
            .unwrap();

        let snapshot = wait_terminal(&f.orchestrator).await;
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.error.unwrap().contains("ended unexpectedly"));
    }

    #[tokio::test]
    async fn test_clean_exit_during_saving_completes() {
        let f = fixture(vec![
            TrainerEvent::Loaded,
            TrainerEvent::Tokenized { records: 10 },
            TrainerEvent::Epoch {
                epoch: 1,
                loss: 1.5,
            },
            TrainerEvent::Exited { code: Some(0) },
        ])
        .await;

        f.orchestrator
            .start(config(1), f.data_file.clone())
            .await
            .unwrap();

        let snapshot = wait_terminal(&f.orchestrator).await;
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.progress, 1.0);
    }

    #[tokio::test]
    async fn test_launch_failure_records_failed_state() {
        let f = fixture(vec![]).await;
        f.backend.fail_launch.store(true, Ordering::SeqCst);

        let err = f
            .orchestrator
            .start(config(2), f.data_file.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::Process(_)));

        let snapshot = f.orchestrator.snapshot().await;
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.error.is_some());
        assert!(!f.orchestrator.is_running().await);
    }

    #[tokio::test]
    async fn test_restart_resets_state() {
        let f = fixture(MockTrainerBackend::successful_run(2)).await;

        f.orchestrator
            .start(config(2), f.data_file.clone())
            .await
            .unwrap();
        wait_terminal(&f.orchestrator).await;

        // Second run with a fresh script
        f.backend
            .set_script(MockTrainerBackend::successful_run(4))
            .await;
        f.orchestrator
            .start(config(4), f.data_file.clone())
            .await
            .unwrap();

        // State was reset on restart
        let snapshot = f.orchestrator.snapshot().await;
        assert!(snapshot.progress < 1.0);
        assert_eq!(snapshot.total_epochs, 4);

        let snapshot = wait_terminal(&f.orchestrator).await;
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.current_epoch, 4);
    }

    #[tokio::test]
    async fn test_log_ring_bounded_to_capacity() {
        let mut state = RunState::new();
        for i in 1..=25 {
            state.push_log(format!("entry {}", i));
        }

        assert_eq!(state.log.len(), RUN_LOG_CAPACITY);
        // Contains exactly the last 20, in order
        let messages: Vec<_> = state.log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages.first(), Some(&"entry 6"));
        assert_eq!(messages.last(), Some(&"entry 25"));
        for window in messages.windows(2) {
            let a: u32 = window[0].trim_start_matches("entry ").parse().unwrap();
            let b: u32 = window[1].trim_start_matches("entry ").parse().unwrap();
            assert_eq!(b, a + 1);
        }
    }

    #[tokio::test]
    async fn test_progress_monotonic_within_run() {
        let f = fixture(MockTrainerBackend::successful_run(5)).await;

        f.orchestrator
            .start(config(5), f.data_file.clone())
            .await
            .unwrap();

        let mut last_progress = 0.0;
        loop {
            let snapshot = f.orchestrator.snapshot().await;
            assert!(
                snapshot.progress >= last_progress,
                "progress regressed: {} -> {}",
                last_progress,
                snapshot.progress
            );
            last_progress = snapshot.progress;
            if snapshot.status == RunStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let temp = TempDir::new().unwrap();
        let data_file = temp.path().join("data.jsonl");
        std::fs::write(&data_file, "{}").unwrap();

        let inventory = Arc::new(ModelInventory::new());
        inventory
            .register(ModelArtifact {
                id: "org/model".to_string(),
                display_name: "model".to_string(),
                size_bytes: 0,
                storage_path: temp.path().join("model"),
                downloaded: true,
            })
            .await
            .unwrap();

        // The channel stays open with no terminal event, so only the run
        // timeout can end this run
        let backend = Arc::new(MockTrainerBackend::new(vec![TrainerEvent::Loaded]));
        backend.hold_open.store(true, Ordering::SeqCst);
        let orchestrator = Orchestrator::new(
            backend,
            inventory,
            Duration::from_millis(30),
            Duration::from_millis(10),
        );

        orchestrator
            .start(config(3), data_file)
            .await
            .unwrap();

        for _ in 0..100 {
            if orchestrator.snapshot().await.status == RunStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = orchestrator.snapshot().await;
        assert_eq!(snapshot.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_test_model_requires_selection() {
        let f = fixture(vec![]).await;

        let err = f.orchestrator.test_model("hello").await.unwrap_err();
        assert!(matches!(err, TuneError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_test_model_returns_response() {
        let f = fixture(vec![]).await;
        f.inventory.select("org/model").await.unwrap();
        *f.backend.eval_response.lock().await = "Hello from the tuned model".to_string();

        let response = f.orchestrator.test_model("hello").await.unwrap();
        assert_eq!(response, "Hello from the tuned model");

        let snapshot = f.orchestrator.snapshot().await;
        assert!(
            snapshot
                .log
                .iter()
                .any(|e| e.message.contains("Hello from the tuned model"))
        );
    }

    #[tokio::test]
    async fn test_test_model_rejected_while_running() {
        let f = fixture(vec![TrainerEvent::Loaded]).await;
        f.backend.hold_open.store(true, Ordering::SeqCst);
        f.inventory.select("org/model").await.unwrap();

        f.orchestrator
            .start(config(5), f.data_file.clone())
            .await
            .unwrap();

        let err = f.orchestrator.test_model("hello").await.unwrap_err();
        assert!(matches!(err, TuneError::AlreadyRunning));

        f.orchestrator.stop().await;
    }
}
