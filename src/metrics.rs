//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record the start of a fine-tuning run
pub fn record_run_started(model_id: &str) {
    metrics::counter!("tune_manager_runs_started_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record a run completing successfully
pub fn record_run_completed() {
    metrics::counter!("tune_manager_runs_completed_total").increment(1);
}

/// Record a run failing
pub fn record_run_failed() {
    metrics::counter!("tune_manager_runs_failed_total").increment(1);
}

/// Record a run stopped by the user
pub fn record_run_stopped() {
    metrics::counter!("tune_manager_runs_stopped_total").increment(1);
}

/// Record a model download completing
pub fn record_download_completed(model_id: &str) {
    metrics::counter!("tune_manager_downloads_completed_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record a model download failure
pub fn record_download_failed(model_id: &str) {
    metrics::counter!("tune_manager_downloads_failed_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Update total cached model count gauge
pub fn update_model_count(count: usize) {
    metrics::gauge!("tune_manager_models_count").set(count as f64);
}
