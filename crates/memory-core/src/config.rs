//! ============================================================================
//! Memory Configuration
//! ============================================================================
//! Defaults, optional JSON file, then environment overrides.
//! Default data dir: ~/.memory-engine (override via MEMORY_DATA_DIR env var)
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};

/// File name of the vector index snapshot inside `data_dir`
pub const INDEX_FILE: &str = "memory.index";
/// File name of the metadata database inside `data_dir`
pub const METADATA_FILE: &str = "memory_metadata.redb";

/// Weights for the four ranking signals. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub relevance: f64,
    pub importance: f64,
    pub recency: f64,
    pub keywords: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            relevance: 0.4,
            importance: 0.3,
            recency: 0.2,
            keywords: 0.1,
        }
    }
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.relevance + self.importance + self.recency + self.keywords
    }
}

/// Configuration for the whole memory subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory holding the index snapshot and the metadata database
    #[serde(alias = "dataDir")]
    pub data_dir: PathBuf,
    /// Embed and persist turns for relevance search
    #[serde(alias = "enableLongMemory")]
    pub enable_long_memory: bool,
    /// Pass turns through the summarization hook before storing
    #[serde(alias = "enableSummary")]
    pub enable_summary: bool,
    /// Short-term window size per owner
    #[serde(alias = "localMemoryNum")]
    pub local_memory_num: usize,
    /// Number of long-term memories returned by a search
    #[serde(alias = "searchMemorySize")]
    pub search_memory_size: usize,
    /// Character budget of the assembled long-term recall
    pub max_recall_chars: usize,
    /// Prefix placed before every recalled memory
    pub recall_prefix: String,
    /// Embedding backend name ("hash" is the only built-in)
    pub embedding_backend: String,
    pub embedding_dim: usize,
    pub weights: ScoringWeights,
    /// Per-hour exponential decay base for recency
    pub recency_decay: f64,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    /// Snapshot the index after this many inserts
    pub persist_every: usize,
    pub candidate_multiplier: usize,
    pub min_candidates: usize,
    pub ivf_nlist: usize,
    pub ivf_nprobe: usize,
    /// Vectors needed before the clustered index is trained
    pub ivf_min_train_size: usize,
    pub search_timeout_ms: u64,
    pub datacenter_id: u64,
    pub worker_id: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            enable_long_memory: true,
            enable_summary: false,
            local_memory_num: 5,
            search_memory_size: 3,
            max_recall_chars: 800,
            recall_prefix: "回忆: ".to_string(),
            embedding_backend: "hash".to_string(),
            embedding_dim: 768,
            weights: ScoringWeights::default(),
            recency_decay: 0.99,
            cache_capacity: 1024,
            cache_ttl_secs: 300,
            persist_every: 10,
            candidate_multiplier: 3,
            min_candidates: 32,
            ivf_nlist: 16,
            ivf_nprobe: 4,
            ivf_min_train_size: 1024,
            search_timeout_ms: 2000,
            datacenter_id: 5,
            worker_id: 5,
        }
    }
}

fn default_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".memory-engine"),
        None => PathBuf::from("storage/memory"),
    }
}

impl MemoryConfig {
    /// Config rooted at `data_dir` with every other value defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a JSON config file. Accepts either the bare config object or one
    /// nested under a `memoryStorageConfig` key.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let section = value
            .get("memoryStorageConfig")
            .cloned()
            .unwrap_or(value);
        let config: MemoryConfig = serde_json::from_value(section)?;
        debug!("Loaded memory config from {}", path.display());
        Ok(config)
    }

    /// Apply MEMORY_* environment overrides on top of `self`
    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("MEMORY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse::<bool>("MEMORY_ENABLE_LONG") {
            self.enable_long_memory = v;
        }
        if let Some(v) = env_parse::<bool>("MEMORY_ENABLE_SUMMARY") {
            self.enable_summary = v;
        }
        if let Some(v) = env_parse::<usize>("MEMORY_LOCAL_NUM") {
            self.local_memory_num = v;
        }
        if let Some(v) = env_parse::<usize>("MEMORY_SEARCH_SIZE") {
            self.search_memory_size = v;
        }
        if let Some(v) = env_parse::<usize>("MEMORY_MAX_CHARS") {
            self.max_recall_chars = v;
        }
        self
    }

    /// Defaults + environment overrides
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    pub fn validate(&self) -> Result<()> {
        if (self.weights.sum() - 1.0).abs() > 1e-3 {
            return Err(MemoryError::Config(format!(
                "scoring weights must sum to 1.0, got {:.4}",
                self.weights.sum()
            )));
        }
        if self.embedding_dim == 0 {
            return Err(MemoryError::Config("embedding_dim must be > 0".into()));
        }
        if self.local_memory_num == 0 {
            return Err(MemoryError::Config("local_memory_num must be > 0".into()));
        }
        if self.ivf_nlist == 0 || self.ivf_nprobe == 0 || self.ivf_nprobe > self.ivf_nlist {
            return Err(MemoryError::Config(format!(
                "ivf_nprobe ({}) must be within 1..=ivf_nlist ({})",
                self.ivf_nprobe, self.ivf_nlist
            )));
        }
        if !(0.0..=1.0).contains(&self.recency_decay) {
            return Err(MemoryError::Config("recency_decay must be within [0, 1]".into()));
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(METADATA_FILE)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    /// First ANN fetch size; the search doubles it while its scope is short
    pub fn candidate_count(&self, limit: usize) -> usize {
        limit
            .saturating_mul(self.candidate_multiplier)
            .max(self.min_candidates)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparsable {}={}", key, raw);
            None
        }
    }
}
