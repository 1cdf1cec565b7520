use crate::error::AnalysisError;
use crate::ngram::{SpeedMode, MAX_NGRAM_SIZE, MIN_NGRAM_SIZE};
use crate::app_dirs::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SEPARATORS: [char; 6] = [' ', '\t', '\n', '\r', '\u{8}', '\0'];

/// Tunables for extraction and aggregation. Every field may be overridden by
/// the host; missing fields in a config file fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub min_ngram_size: usize,
    pub max_ngram_size: usize,
    pub separators: Vec<char>,
    pub decay_factor: f64,
    pub max_samples_per_ngram: usize,
    pub recent_sessions: usize,
    /// Target for an n-gram of size n is `n * target_ms_per_keystroke`.
    pub target_ms_per_keystroke: f64,
    pub amber_threshold_pct: f64,
    /// Summaries last measured longer ago than this are left out of ranked
    /// views. `None` keeps every row.
    pub freshness_days: Option<u32>,
    pub summary_speed_mode: SpeedMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_ngram_size: MIN_NGRAM_SIZE,
            max_ngram_size: MAX_NGRAM_SIZE,
            separators: DEFAULT_SEPARATORS.to_vec(),
            decay_factor: 0.9,
            max_samples_per_ngram: 20,
            recent_sessions: 100,
            target_ms_per_keystroke: 600.0,
            amber_threshold_pct: 75.0,
            freshness_days: Some(90),
            summary_speed_mode: SpeedMode::Raw,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.min_ngram_size < MIN_NGRAM_SIZE {
            return Err(AnalysisError::InvalidConfig(format!(
                "min_ngram_size must be at least {MIN_NGRAM_SIZE}, got {}",
                self.min_ngram_size
            )));
        }
        if self.max_ngram_size < self.min_ngram_size {
            return Err(AnalysisError::InvalidConfig(format!(
                "max_ngram_size ({}) is below min_ngram_size ({})",
                self.max_ngram_size, self.min_ngram_size
            )));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err(AnalysisError::InvalidConfig(format!(
                "decay_factor must be in (0, 1], got {}",
                self.decay_factor
            )));
        }
        if self.max_samples_per_ngram == 0 || self.recent_sessions == 0 {
            return Err(AnalysisError::InvalidConfig(
                "history windows must be non-empty".to_string(),
            ));
        }
        if !(self.target_ms_per_keystroke > 0.0) {
            return Err(AnalysisError::InvalidConfig(format!(
                "target_ms_per_keystroke must be positive, got {}",
                self.target_ms_per_keystroke
            )));
        }
        Ok(())
    }

    pub fn is_separator(&self, c: char) -> bool {
        self.separators.contains(&c)
    }

    pub fn target_speed_ms(&self, ngram_size: usize) -> f64 {
        self.target_ms_per_keystroke * ngram_size as f64
    }
}

pub trait ConfigStore {
    fn load(&self) -> EngineConfig;
    fn save(&self, cfg: &EngineConfig) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let path =
            AppDirs::config_path().unwrap_or_else(|| PathBuf::from("keygram_config.json"));
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> EngineConfig {
        if let Ok(bytes) = fs::read(&self.path) {
            match serde_json::from_slice::<EngineConfig>(&bytes) {
                Ok(cfg) => return cfg,
                Err(e) => tracing::warn!(
                    "ignoring unreadable config {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
        EngineConfig::default()
    }

    fn save(&self, cfg: &EngineConfig) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg).map_err(std::io::Error::other)?;
        fs::write(&self.path, data)
    }
}
