//! Model inventory: locally available artifacts and the current selection
//!
//! The cache follows the HuggingFace hub layout:
//! ```text
//! <cache>/
//! ├── models--mistralai--Mistral-7B-Instruct-v0.1/
//! │   ├── snapshots/
//! │   │   └── {revision}/
//! │   │       ├── config.json
//! │   │       └── model.safetensors
//! │   └── refs/
//! │       └── main
//! └── models--Qwen--Qwen2-0.5B/
//!     └── ...
//! ```

use crate::error::{TuneError, TuneResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// A locally stored model checkpoint/weights bundle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelArtifact {
    /// Stable identifier, e.g. "mistralai/Mistral-7B-Instruct-v0.1"
    pub id: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub storage_path: PathBuf,
    /// True once fully materialized on disk
    pub downloaded: bool,
}

impl ModelArtifact {
    /// Build an artifact record from a cached snapshot directory
    pub fn from_snapshot(id: &str, snapshot: PathBuf, size_bytes: u64) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name_for(id),
            size_bytes,
            storage_path: snapshot,
            downloaded: true,
        }
    }
}

/// Human-readable label derived from the repo part of the id
fn display_name_for(id: &str) -> String {
    id.rsplit('/').next().unwrap_or(id).replace('-', " ")
}

struct Inner {
    artifacts: HashMap<String, ModelArtifact>,
    selected: Option<String>,
}

/// Tracks installed artifacts and at most one selection
///
/// All mutations go through a single lock, so concurrent delete/select on
/// the same id cannot race into an inconsistent selection.
pub struct ModelInventory {
    inner: RwLock<Inner>,
}

impl ModelInventory {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                artifacts: HashMap::new(),
                selected: None,
            }),
        }
    }

    /// Enumerate cached models under `cache_dir` and replace the inventory
    ///
    /// An empty directory yields an empty inventory; only an unreadable
    /// directory is an error. The selection survives a rescan unless the
    /// selected artifact is gone.
    pub async fn scan(&self, cache_dir: &Path) -> TuneResult<Vec<ModelArtifact>> {
        let entries = std::fs::read_dir(cache_dir).map_err(|e| {
            TuneError::Storage(format!("cannot read cache directory {:?}: {}", cache_dir, e))
        })?;

        let mut discovered = HashMap::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(model_id) = cache_name_to_model_id(&name) else {
                continue;
            };
            let Some(snapshot) = latest_snapshot(&entry.path()) else {
                continue;
            };
            let size_bytes = dir_size(&entry.path());
            discovered.insert(
                model_id.clone(),
                ModelArtifact::from_snapshot(&model_id, snapshot, size_bytes),
            );
        }

        let mut inner = self.inner.write().await;
        if let Some(selected) = &inner.selected
            && !discovered.contains_key(selected)
        {
            tracing::info!(model = %selected, "Selected model no longer cached, clearing selection");
            inner.selected = None;
        }
        inner.artifacts = discovered;

        let mut list: Vec<_> = inner.artifacts.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));

        tracing::info!(count = list.len(), cache_dir = ?cache_dir, "Inventory scan complete");
        Ok(list)
    }

    /// Mark an artifact as selected
    pub async fn select(&self, id: &str) -> TuneResult<ModelArtifact> {
        let mut inner = self.inner.write().await;
        let artifact = inner
            .artifacts
            .get(id)
            .cloned()
            .ok_or_else(|| TuneError::NotFound(id.to_string()))?;
        inner.selected = Some(id.to_string());
        Ok(artifact)
    }

    /// Clear the selection
    pub async fn deselect(&self) {
        self.inner.write().await.selected = None;
    }

    /// Remove an artifact record; clears the selection if it pointed here
    ///
    /// Deleting an unknown id is a no-op.
    pub async fn delete(&self, id: &str) {
        let mut inner = self.inner.write().await;
        inner.artifacts.remove(id);
        if inner.selected.as_deref() == Some(id) {
            inner.selected = None;
        }
    }

    /// Insert a newly downloaded artifact
    pub async fn register(&self, artifact: ModelArtifact) -> TuneResult<()> {
        let mut inner = self.inner.write().await;
        if inner.artifacts.contains_key(&artifact.id) {
            return Err(TuneError::Duplicate(artifact.id));
        }
        tracing::info!(model = %artifact.id, size_bytes = artifact.size_bytes, "Artifact registered");
        inner.artifacts.insert(artifact.id.clone(), artifact);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<ModelArtifact> {
        self.inner.read().await.artifacts.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.artifacts.contains_key(id)
    }

    /// All artifacts, sorted by id
    pub async fn list(&self) -> Vec<ModelArtifact> {
        let inner = self.inner.read().await;
        let mut list: Vec<_> = inner.artifacts.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn selected(&self) -> Option<ModelArtifact> {
        let inner = self.inner.read().await;
        inner
            .selected
            .as_ref()
            .and_then(|id| inner.artifacts.get(id))
            .cloned()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.artifacts.len()
    }
}

impl Default for ModelInventory {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert model ID to cache directory name
///
/// e.g. "mistralai/Mistral-7B-Instruct-v0.1" -> "models--mistralai--Mistral-7B-Instruct-v0.1"
pub fn model_id_to_cache_name(model_id: &str) -> String {
    format!("models--{}", model_id.replace('/', "--"))
}

/// Convert cache directory name back to model ID
fn cache_name_to_model_id(cache_name: &str) -> Option<String> {
    cache_name
        .strip_prefix("models--")
        .map(|s| s.replacen("--", "/", 1))
}

/// Locate a model's snapshot directory, preferring the refs/main revision
pub fn latest_snapshot(model_dir: &Path) -> Option<PathBuf> {
    let refs_main = model_dir.join("refs/main");
    if refs_main.exists()
        && let Ok(revision) = std::fs::read_to_string(&refs_main)
    {
        let snapshot = model_dir.join("snapshots").join(revision.trim());
        if snapshot.join("config.json").exists() {
            return Some(snapshot);
        }
    }

    // Fall back to the first snapshot carrying a config.json
    let snapshots = model_dir.join("snapshots");
    for entry in std::fs::read_dir(&snapshots).ok()?.flatten() {
        let path = entry.path();
        if path.join("config.json").exists() {
            return Some(path);
        }
    }

    None
}

/// Recursively calculate directory size
pub fn dir_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                size += dir_size(&path);
            } else if let Ok(metadata) = std::fs::metadata(&path) {
                size += metadata.len();
            }
        }
    }

    size
}
