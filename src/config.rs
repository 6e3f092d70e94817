use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

/// Where graphs live on disk
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one `<namespace>.jsonl` store and one
    /// `<namespace>.index.json` snapshot per namespace.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Namespace used when a call does not name one.
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            default_namespace: default_namespace(),
            log_level: default_log_level(),
        }
    }
}

/// Ranking parameters
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// BM25 term-frequency saturation, tuned below the usual 1.2 for small graphs.
    #[serde(default = "default_k1")]
    pub k1: f64,
    /// BM25 length normalization.
    #[serde(default = "default_b")]
    pub b: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            k1: default_k1(),
            b: default_b(),
        }
    }
}

/// Search index maintenance thresholds (document counts)
#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    /// Below this many documents, zero BM25 scores fall back to token overlap.
    #[serde(default = "default_small_corpus_max_docs")]
    pub small_corpus_max_docs: usize,
    /// Snapshots are only written once the index holds this many documents.
    #[serde(default = "default_persist_min_docs")]
    pub persist_min_docs: usize,
    /// From this size on, mutations mark the index dirty instead of rebuilding.
    #[serde(default = "default_deferred_rebuild_min_docs")]
    pub deferred_rebuild_min_docs: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            small_corpus_max_docs: default_small_corpus_max_docs(),
            persist_min_docs: default_persist_min_docs(),
            deferred_rebuild_min_docs: default_deferred_rebuild_min_docs(),
        }
    }
}

/// Manager write strategy
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// `create_entities` batches up to this size use the streaming existence
    /// check and append-only write.
    #[serde(default = "default_streaming_batch_limit")]
    pub streaming_batch_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            streaming_batch_limit: default_streaming_batch_limit(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("kgmem"))
        .unwrap_or_else(|| PathBuf::from(".kgmem"))
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_top_k() -> usize {
    10
}

fn default_k1() -> f64 {
    1.0
}

fn default_b() -> f64 {
    0.5
}

fn default_small_corpus_max_docs() -> usize {
    10
}

fn default_persist_min_docs() -> usize {
    50
}

fn default_deferred_rebuild_min_docs() -> usize {
    100
}

fn default_streaming_batch_limit() -> usize {
    10
}

impl Config {
    /// Load configuration
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in KGMEM_CONFIG environment variable
    /// 2. ./kgmem.toml in current directory
    ///
    /// If neither exists, defaults are used. `KGMEM_DATA_DIR` overrides
    /// `store.base_dir` in every case.
    pub fn load() -> Result<Self> {
        // Load .env file if it exists (ignore errors - file is optional)
        let _ = dotenv::dotenv();

        let mut config = match std::env::var("KGMEM_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => {
                let local = PathBuf::from("kgmem.toml");
                if local.exists() {
                    Self::from_file(&local)?
                } else {
                    Config::default()
                }
            }
        };

        if let Ok(dir) = std::env::var("KGMEM_DATA_DIR") {
            config.store.base_dir = PathBuf::from(dir);
        }

        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML config file without consulting the environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Defaults rooted at `base_dir`. Handy for embedding and tests.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.store.base_dir = base_dir.into();
        config
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.store.default_namespace.trim().is_empty() {
            anyhow::bail!("store.default_namespace must not be empty");
        }

        if self.search.default_top_k == 0 {
            anyhow::bail!("search.default_top_k must be greater than 0");
        }

        if !(self.search.k1 > 0.0) {
            anyhow::bail!("search.k1 must be greater than 0.0");
        }

        if !(0.0..=1.0).contains(&self.search.b) {
            anyhow::bail!("search.b must be between 0.0 and 1.0");
        }

        Ok(())
    }

    /// Get the directory holding all namespace files
    pub fn base_dir(&self) -> &Path {
        &self.store.base_dir
    }
}
