//! Model download coordination
//!
//! Fetches model artifacts from HuggingFace Hub into the local cache using
//! the native hf-hub crate, then registers them with the inventory.
//! At most one download per model id is in flight at any time, and
//! registration is all-or-nothing.

use crate::error::{TuneError, TuneResult};
use crate::inventory::{ModelArtifact, ModelInventory, dir_size, model_id_to_cache_name};
use async_trait::async_trait;
use dashmap::DashSet;
use hf_hub::api::tokio::ApiBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for fetching a model's files into the local cache
#[async_trait]
pub trait HubFetcher: Send + Sync {
    /// Download all files for `model_id`; returns the snapshot directory
    async fn fetch(&self, model_id: &str, cache_dir: &Path) -> Result<PathBuf, String>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production fetcher backed by the HuggingFace Hub API
pub struct HfHubFetcher;

impl HfHubFetcher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HfHubFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HubFetcher for HfHubFetcher {
    async fn fetch(&self, model_id: &str, cache_dir: &Path) -> Result<PathBuf, String> {
        tracing::info!(model_id = %model_id, cache_dir = ?cache_dir, "Starting model download via hf-hub");

        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir.to_path_buf())
            .build()
            .map_err(|e| format!("Failed to create HF API client: {}", e))?;

        let repo = api.model(model_id.to_string());

        // Files every causal LM checkpoint needs
        let essential_files = ["config.json", "tokenizer.json"];

        let mut config_path: Option<PathBuf> = None;
        for file in &essential_files {
            tracing::debug!(model_id = %model_id, file = %file, "Downloading file");
            let path = repo
                .get(file)
                .await
                .map_err(|e| format!("Failed to download {}: {}", file, e))?;

            // Save config.json path to derive snapshot dir
            if *file == "config.json" {
                config_path = Some(path);
            }
        }

        // Weights: safetensors preferred, sharded or single-file, with a
        // pytorch fallback
        let weight_files = [
            "model.safetensors",
            "model.safetensors.index.json",
            "pytorch_model.bin",
        ];

        let mut downloaded_weights = false;
        for file in &weight_files {
            match repo.get(file).await {
                Ok(path) => {
                    tracing::debug!(model_id = %model_id, file = %file, "Downloaded weight file");
                    downloaded_weights = true;

                    if file.ends_with(".index.json") {
                        download_shards(&repo, model_id, &path).await?;
                    }
                    break;
                }
                Err(_) => continue,
            }
        }

        if !downloaded_weights {
            return Err(format!("No weight files found for {}", model_id));
        }

        // Optional companion files; absence is fine
        let optional_files = [
            "tokenizer_config.json",
            "special_tokens_map.json",
            "generation_config.json",
        ];

        for file in &optional_files {
            if repo.get(file).await.is_ok() {
                tracing::debug!(model_id = %model_id, file = %file, "Downloaded optional file");
            }
        }

        // The snapshot directory is the parent of config.json
        config_path
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .ok_or_else(|| {
                format!(
                    "Model downloaded but snapshot path not found for {}",
                    model_id
                )
            })
    }
}

/// Download sharded weight files referenced in an index file
async fn download_shards(
    repo: &hf_hub::api::tokio::ApiRepo,
    model_id: &str,
    index_path: &Path,
) -> Result<(), String> {
    let index_content = tokio::fs::read_to_string(index_path)
        .await
        .map_err(|e| format!("Failed to read index file: {}", e))?;

    let index: serde_json::Value = serde_json::from_str(&index_content)
        .map_err(|e| format!("Failed to parse index file: {}", e))?;

    if let Some(weight_map) = index.get("weight_map").and_then(|v| v.as_object()) {
        let shards: std::collections::HashSet<&str> =
            weight_map.values().filter_map(|v| v.as_str()).collect();

        tracing::info!(
            model_id = %model_id,
            shard_count = shards.len(),
            "Downloading sharded weights"
        );

        for shard in shards {
            repo.get(shard)
                .await
                .map_err(|e| format!("Failed to download shard {}: {}", shard, e))?;
        }
    }

    Ok(())
}

// ============================================================================
// Download Coordinator
// ============================================================================

/// Coordinates downloads and inventory registration
pub struct DownloadCoordinator {
    inventory: Arc<ModelInventory>,
    cache_dir: PathBuf,
    fetcher: Arc<dyn HubFetcher>,
    in_flight: DashSet<String>,
}

impl DownloadCoordinator {
    /// Create a coordinator with a custom fetcher
    pub fn new_with_fetcher(
        inventory: Arc<ModelInventory>,
        cache_dir: PathBuf,
        fetcher: Arc<dyn HubFetcher>,
    ) -> Self {
        Self {
            inventory,
            cache_dir,
            fetcher,
            in_flight: DashSet::new(),
        }
    }

    /// Create a coordinator using the HuggingFace Hub fetcher
    pub fn new(inventory: Arc<ModelInventory>, cache_dir: PathBuf) -> Self {
        Self::new_with_fetcher(inventory, cache_dir, Arc::new(HfHubFetcher::new()))
    }

    /// Download a model and register it exactly once
    ///
    /// A second call for the same id while the first is in flight fails
    /// fast; on any failure nothing is registered.
    pub async fn download(&self, model_id: &str) -> TuneResult<ModelArtifact> {
        if !self.in_flight.insert(model_id.to_string()) {
            return Err(TuneError::Download {
                id: model_id.to_string(),
                reason: "download already in progress".to_string(),
            });
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            id: model_id,
        };

        let snapshot = self
            .fetcher
            .fetch(model_id, &self.cache_dir)
            .await
            .map_err(|reason| {
                crate::metrics::record_download_failed(model_id);
                TuneError::Download {
                    id: model_id.to_string(),
                    reason,
                }
            })?;

        let size_bytes = dir_size(&self.cache_dir.join(model_id_to_cache_name(model_id)));
        let artifact = ModelArtifact::from_snapshot(model_id, snapshot, size_bytes);

        self.inventory.register(artifact.clone()).await?;

        crate::metrics::record_download_completed(model_id);
        crate::metrics::update_model_count(self.inventory.count().await);
        tracing::info!(model_id = %model_id, size_bytes, "Model downloaded and registered");

        Ok(artifact)
    }
}

/// RAII guard releasing the in-flight slot for an id
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    id: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use mocks::MockFetcher;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    fn coordinator(
        delay_ms: u64,
    ) -> (Arc<DownloadCoordinator>, Arc<ModelInventory>, Arc<MockFetcher>, TempDir) {
        let temp = TempDir::new().unwrap();
        let inventory = Arc::new(ModelInventory::new());
        let fetcher = Arc::new(MockFetcher::new(Duration::from_millis(delay_ms)));
        let coordinator = Arc::new(DownloadCoordinator::new_with_fetcher(
            inventory.clone(),
            temp.path().to_path_buf(),
            fetcher.clone(),
        ));
        (coordinator, inventory, fetcher, temp)
    }

    #[tokio::test]
    async fn test_download_registers_artifact() {
        let (coordinator, inventory, _, _temp) = coordinator(0);

        let artifact = coordinator.download("org/model").await.unwrap();
        assert_eq!(artifact.id, "org/model");
        assert!(artifact.downloaded);
        assert!(artifact.storage_path.ends_with("snapshots/mock"));
        assert!(inventory.contains("org/model").await);
    }

    #[tokio::test]
    async fn test_concurrent_downloads_register_exactly_once() {
        let (coordinator, inventory, fetcher, _temp) = coordinator(50);

        let a = tokio::spawn({
            let c = coordinator.clone();
            async move { c.download("org/model").await }
        });
        let b = tokio::spawn({
            let c = coordinator.clone();
            async move { c.download("org/model").await }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        // One wins, the other fails fast
        assert!(a.is_ok() ^ b.is_ok());
        assert_eq!(inventory.count().await, 1);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_download_registers_nothing() {
        let (coordinator, inventory, fetcher, _temp) = coordinator(0);
        fetcher.fail.store(true, Ordering::SeqCst);

        let err = coordinator.download("org/model").await.unwrap_err();
        assert!(matches!(err, TuneError::Download { .. }));
        assert_eq!(inventory.count().await, 0);
    }

    #[tokio::test]
    async fn test_retry_allowed_after_failure() {
        let (coordinator, inventory, fetcher, _temp) = coordinator(0);

        fetcher.fail.store(true, Ordering::SeqCst);
        coordinator.download("org/model").await.unwrap_err();

        // The in-flight slot was released; a retry succeeds
        fetcher.fail.store(false, Ordering::SeqCst);
        coordinator.download("org/model").await.unwrap();
        assert!(inventory.contains("org/model").await);
    }

    #[tokio::test]
    async fn test_download_of_registered_model_is_duplicate() {
        let (coordinator, _, _, _temp) = coordinator(0);

        coordinator.download("org/model").await.unwrap();
        let err = coordinator.download("org/model").await.unwrap_err();
        assert!(matches!(err, TuneError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_distinct_ids_download_in_parallel() {
        let (coordinator, inventory, _, _temp) = coordinator(20);

        let a = tokio::spawn({
            let c = coordinator.clone();
            async move { c.download("org/alpha").await }
        });
        let b = tokio::spawn({
            let c = coordinator.clone();
            async move { c.download("org/beta").await }
        });

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(inventory.count().await, 2);
    }
}
