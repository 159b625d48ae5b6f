use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::classifier::MissingCreationPolicy;
use crate::constants::{
    DEFAULT_BACKGROUND_THRESHOLD, DEFAULT_CACHE_TTL, DEFAULT_IDLE_INTERVAL,
    DEFAULT_LOOKUP_BATCH_SIZE, DEFAULT_OPTIMISTIC_GRACE, DEFAULT_OPTIMISTIC_TIMEOUT,
    DEFAULT_PERSISTED_CACHE_TTL, DEFAULT_PROGRESS_EVERY,
};

/// Runtime configuration. Every field has a default, so `{}` is a valid config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FollowUpConfig {
    /// Directory holding the persisted calculation cache
    pub data_dir: PathBuf,

    /// Owner of persisted cache rows
    pub user_id: String,

    pub lookup_batch_size: usize,
    pub cache_ttl_secs: u64,
    pub idle_interval_ms: u64,
    pub optimistic_grace_ms: u64,
    pub optimistic_timeout_secs: u64,
    pub progress_every: usize,

    /// Contact sets at least this large are classified on the background worker
    pub background_threshold: usize,

    pub missing_creation_policy: MissingCreationPolicy,

    /// Keep calculation results in the on-disk cache as well as in memory
    pub persist_cache: bool,
    pub persisted_cache_ttl_secs: u64,
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("followup_data"),
            user_id: "local".to_string(),
            lookup_batch_size: DEFAULT_LOOKUP_BATCH_SIZE,
            cache_ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
            idle_interval_ms: DEFAULT_IDLE_INTERVAL.as_millis() as u64,
            optimistic_grace_ms: DEFAULT_OPTIMISTIC_GRACE.as_millis() as u64,
            optimistic_timeout_secs: DEFAULT_OPTIMISTIC_TIMEOUT.as_secs(),
            progress_every: DEFAULT_PROGRESS_EVERY,
            background_threshold: DEFAULT_BACKGROUND_THRESHOLD,
            missing_creation_policy: MissingCreationPolicy::default(),
            persist_cache: true,
            persisted_cache_ttl_secs: DEFAULT_PERSISTED_CACHE_TTL.as_secs(),
        }
    }
}

impl FollowUpConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize config")
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn optimistic_grace(&self) -> Duration {
        Duration::from_millis(self.optimistic_grace_ms)
    }

    pub fn optimistic_timeout(&self) -> Duration {
        Duration::from_secs(self.optimistic_timeout_secs)
    }

    pub fn persisted_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.persisted_cache_ttl_secs)
    }
}
