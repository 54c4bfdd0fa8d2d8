//! Model hub - supplies (weights, spec) pairs for a task
//!
//! The core never downloads anything. [`CacheHub`] reads weights that a hub
//! client already placed in the local cache, keyed by repository, revision and
//! file name; anything missing is a [`SegError::ModelResolution`].

use ahash::AHashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::config::PipelineConfig;
use crate::core::error::{Result, SegError};
use crate::core::types::{SpeedMode, TaskName};
use crate::task::{catalog, ModelSpec};

/// Raw, immutable model weights
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightsBlob {
    name: String,
    bytes: Arc<[u8]>,
}

impl WeightsBlob {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// One sub-model ready to load
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub weights: WeightsBlob,
    pub spec: ModelSpec,
}

/// Source of the sub-models of a task, in orchestration order
pub trait ModelHub: Send + Sync {
    fn resolve(&self, task: TaskName, speed: SpeedMode) -> Result<Vec<ResolvedModel>>;
}

/// Hub backed by a local cache directory
///
/// Layout: `<root>/<repo with '/' replaced by "--">/<revision>/<weights file>`.
/// Resolved tasks are memoized, so a second run never touches the disk again.
#[derive(Debug)]
pub struct CacheHub {
    root: PathBuf,
    repo: String,
    revision: String,
    resolved: Mutex<AHashMap<(TaskName, SpeedMode), Vec<ResolvedModel>>>,
}

impl CacheHub {
    pub fn new(root: impl Into<PathBuf>, repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            repo: repo.into(),
            revision: revision.into(),
            resolved: Mutex::new(AHashMap::new()),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.resolved_cache_root(),
            config.hub_repo.clone(),
            config.hub_revision.clone(),
        )
    }

    /// Directory holding the weights of the configured revision
    pub fn revision_dir(&self) -> PathBuf {
        self.root
            .join(self.repo.replace('/', "--"))
            .join(&self.revision)
    }

    pub fn weights_path(&self, spec: &ModelSpec) -> PathBuf {
        self.revision_dir().join(&spec.weights_file)
    }

    /// Catalog weights files of a task not present in the revision directory
    pub fn missing_weights(&self, task: TaskName, speed: SpeedMode) -> Vec<String> {
        let dir = self.revision_dir();
        catalog::model_specs(task, speed)
            .into_iter()
            .map(|spec| spec.weights_file)
            .filter(|file| !dir.join(file).is_file())
            .collect()
    }

    /// Whether every weights file of a task is present
    pub fn is_cached(&self, task: TaskName, speed: SpeedMode) -> bool {
        self.missing_weights(task, speed).is_empty()
    }

    fn read_weights(&self, spec: &ModelSpec) -> Result<WeightsBlob> {
        let path = self.weights_path(spec);
        let bytes = std::fs::read(&path).map_err(|e| {
            SegError::ModelResolution(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(WeightsBlob::new(spec.weights_file.clone(), bytes))
    }
}

impl ModelHub for CacheHub {
    fn resolve(&self, task: TaskName, speed: SpeedMode) -> Result<Vec<ResolvedModel>> {
        if let Some(hit) = self.resolved.lock().get(&(task, speed)) {
            tracing::debug!(%task, %speed, "Model cache hit");
            return Ok(hit.clone());
        }

        let missing = self.missing_weights(task, speed);
        if !missing.is_empty() {
            return Err(SegError::ModelResolution(format!(
                "weights {} for task {} ({}) not found in cache at {}",
                missing.join(", "),
                task,
                speed,
                self.revision_dir().display()
            )));
        }

        let models = catalog::model_specs(task, speed)
            .into_iter()
            .map(|spec| {
                let weights = self.read_weights(&spec)?;
                Ok(ResolvedModel { weights, spec })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            %task,
            %speed,
            models = models.len(),
            dir = %self.revision_dir().display(),
            "Resolved models from local cache"
        );
        self.resolved.lock().insert((task, speed), models.clone());
        Ok(models)
    }
}

/// Hub serving models registered in memory, used for embedding and tests
#[derive(Debug, Default)]
pub struct StaticHub {
    models: AHashMap<(TaskName, SpeedMode), Vec<ResolvedModel>>,
}

impl StaticHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: TaskName, speed: SpeedMode, models: Vec<ResolvedModel>) {
        self.models.insert((task, speed), models);
    }
}

impl ModelHub for StaticHub {
    fn resolve(&self, task: TaskName, speed: SpeedMode) -> Result<Vec<ResolvedModel>> {
        self.models.get(&(task, speed)).cloned().ok_or_else(|| {
            SegError::ModelResolution(format!("no models registered for task {} ({})", task, speed))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_weights_is_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        let hub = CacheHub::new(dir.path(), "org/models", "main");
        let err = hub.resolve(TaskName::Total, SpeedMode::Fast).unwrap_err();
        assert!(matches!(err, SegError::ModelResolution(_)));
        assert_eq!(hub.missing_weights(TaskName::Total, SpeedMode::Fast), vec!["M297.pt".to_string()]);
    }

    #[test]
    fn test_partial_cache_names_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let hub = CacheHub::new(dir.path(), "org/models", "main");
        std::fs::create_dir_all(hub.revision_dir()).unwrap();
        std::fs::write(hub.revision_dir().join("M850.pt"), b"weights").unwrap();

        assert!(!hub.is_cached(TaskName::TotalMr, SpeedMode::Normal));
        let err = hub.resolve(TaskName::TotalMr, SpeedMode::Normal).unwrap_err().to_string();
        assert!(err.contains("M851.pt"));
        assert!(!err.contains("M850.pt"));
    }

    #[test]
    fn test_resolves_and_memoizes() {
        let dir = tempfile::tempdir().unwrap();
        let hub = CacheHub::new(dir.path(), "org/models", "main");
        let revision_dir = hub.revision_dir();
        std::fs::create_dir_all(&revision_dir).unwrap();
        for spec in catalog::model_specs(TaskName::TotalMr, SpeedMode::Normal) {
            std::fs::write(revision_dir.join(&spec.weights_file), b"weights").unwrap();
        }
        assert!(hub.is_cached(TaskName::TotalMr, SpeedMode::Normal));

        let models = hub.resolve(TaskName::TotalMr, SpeedMode::Normal).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].spec.name, "M850");
        assert_eq!(models[0].weights.bytes(), b"weights");

        // Served from memory even after the cache directory is gone
        std::fs::remove_dir_all(&revision_dir).unwrap();
        assert!(hub.resolve(TaskName::TotalMr, SpeedMode::Normal).is_ok());
    }

    #[test]
    fn test_static_hub_unknown_task() {
        let hub = StaticHub::new();
        assert!(hub.resolve(TaskName::Total, SpeedMode::Normal).is_err());
    }
}
