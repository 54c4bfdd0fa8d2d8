//! Pipeline configuration with documented constants
//!
//! Everything that shapes a run but is not part of a model's own description
//! lives here: blending, batching, device budgets, fusion policy, model cache.
//! Values can be loaded from a TOML file; missing keys keep their defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::error::{Result, SegError};
use crate::fusion::ConflictPolicy;
use crate::patch::BlendMode;

const GIB: u64 = 1024 * 1024 * 1024;

/// Configuration for one inference run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === PATCH BLENDING ===
    /// Weighting applied to overlapping patch outputs before they are summed
    ///
    /// Linear taper is the default. Gaussian matches importance weighting used
    /// by most sliding-window segmenters; Constant disables tapering.
    pub blend_mode: BlendMode,

    /// Value written into resampled intensity volumes outside the source image
    pub intensity_background: f32,

    // === BATCHING / DEVICES ===
    /// Number of CPU workers when no GPU is assigned
    pub cpu_workers: usize,

    /// Upper bound on patches per forward call, whatever the memory allows
    pub max_batch_size: usize,

    /// Memory budget of the host when inferring on CPU (bytes)
    ///
    /// Shared by all CPU workers, since they share one copy of the weights.
    pub cpu_memory_bytes: u64,

    /// Memory budget of each GPU (bytes)
    pub gpu_memory_bytes: u64,

    /// Batches queued per worker ahead of the one being computed
    ///
    /// Bounds in-flight patches to roughly
    /// `(queue_depth + 1) * batch_size * workers`.
    pub queue_depth: usize,

    // === ORCHESTRATION ===
    /// Sub-models allowed to run at the same time
    ///
    /// 1 runs sub-models strictly one after another (bounded memory). Larger
    /// values need enough device budget for every concurrently loaded model.
    pub concurrent_submodels: usize,

    /// Resolution of voxels claimed by two sub-models
    pub conflict_policy: ConflictPolicy,

    // === MODEL HUB ===
    /// Root of the local model cache, `None` = `$ORGANSEG_CACHE` or user cache dir
    pub cache_root: Option<PathBuf>,

    /// Hub repository the models were published under
    pub hub_repo: String,

    /// Model revision used as the cache key next to the task
    pub hub_revision: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            blend_mode: BlendMode::Linear,
            intensity_background: 0.0,

            cpu_workers: 1,
            max_batch_size: 4,
            cpu_memory_bytes: 8 * GIB,
            gpu_memory_bytes: 8 * GIB,
            queue_depth: 1,

            concurrent_submodels: 1,
            conflict_policy: ConflictPolicy::LastWins,

            cache_root: None,
            hub_repo: "VBoussot/TotalSegmentator-KonfAI".to_string(),
            hub_revision: "main".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from TOML text; absent keys keep defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| SegError::Config(format!("failed to parse config TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validate configuration for internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.cpu_workers == 0 {
            return Err(SegError::Config("cpu_workers must be at least 1".into()));
        }
        if self.max_batch_size == 0 {
            return Err(SegError::Config("max_batch_size must be at least 1".into()));
        }
        if self.concurrent_submodels == 0 {
            return Err(SegError::Config(
                "concurrent_submodels must be at least 1".into(),
            ));
        }
        if self.cpu_memory_bytes == 0 || self.gpu_memory_bytes == 0 {
            return Err(SegError::Config("device memory budgets must be positive".into()));
        }
        if !self.intensity_background.is_finite() {
            return Err(SegError::Config(format!(
                "intensity_background must be finite, got {}",
                self.intensity_background
            )));
        }
        Ok(())
    }

    /// Model cache root after applying the environment fallback chain
    pub fn resolved_cache_root(&self) -> PathBuf {
        if let Some(root) = &self.cache_root {
            return root.clone();
        }
        if let Ok(env_root) = std::env::var("ORGANSEG_CACHE") {
            return PathBuf::from(env_root);
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("organseg")
    }
}
