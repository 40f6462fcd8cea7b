//! Settings: the TOML file, its defaults, and runtime updates.
//!
//! Settings live at `$HOME/.config/devctx/settings.toml` unless overridden
//! by `--config` or `DEVCTX_CONFIG`. A missing file means defaults. Every
//! update is validated against the merged result and then the whole file is
//! rewritten (temp file + rename).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use devctx_core::chunk::ChunkParams;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_max_excerpt_chars")]
    pub max_excerpt_chars: usize,
    #[serde(default = "default_tree_budget")]
    pub tree_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            max_excerpt_chars: default_max_excerpt_chars(),
            tree_budget: default_tree_budget(),
        }
    }
}

fn default_enabled() -> bool {
    true
}
fn default_top_k() -> usize {
    8
}
fn default_similarity_threshold() -> f32 {
    0.3
}
fn default_max_excerpt_chars() -> usize {
    1200
}
fn default_tree_budget() -> usize {
    2000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_cache_key_chars")]
    pub cache_key_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            dims: default_dims(),
            cache_size: default_cache_size(),
            cache_key_chars: default_cache_key_chars(),
        }
    }
}

fn default_model() -> String {
    "all-minilm-l6-v2".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_cache_size() -> usize {
    1000
}
fn default_cache_key_chars() -> usize {
    256
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            max_chunks: default_max_chunks(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams::new(self.chunk_size, self.overlap, self.max_chunks)
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}
fn default_max_chunks() -> usize {
    200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Files processed between cooperative yields.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_yield_ms")]
    pub yield_ms: u64,
    /// Files larger than this are dropped before any read.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// A file taking longer than this to index triggers a status warning.
    #[serde(default = "default_slow_file_ms")]
    pub slow_file_ms: u64,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            yield_ms: default_yield_ms(),
            max_file_bytes: default_max_file_bytes(),
            slow_file_ms: default_slow_file_ms(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_yield_ms() -> u64 {
    25
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}
fn default_slow_file_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_store_path() -> PathBuf {
    home_dir().join(".local/share/devctx/index.json")
}

/// `$DEVCTX_CONFIG`, else `$HOME/.config/devctx/settings.toml`.
pub fn default_config_path() -> PathBuf {
    match std::env::var_os("DEVCTX_CONFIG") {
        Some(p) => PathBuf::from(p),
        None => home_dir().join(".config/devctx/settings.toml"),
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
        }
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.overlap,
                self.chunking.chunk_size
            );
        }
        if self.chunking.max_chunks < 1 {
            bail!("chunking.max_chunks must be >= 1");
        }
        if self.embedding.dims == 0 {
            bail!("embedding.dims must be > 0");
        }
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }
        for glob in &self.indexing.exclude_globs {
            globset::Glob::new(glob)
                .with_context(|| format!("Invalid indexing.exclude_globs entry: {}", glob))?;
        }
        Ok(())
    }
}

/// Read settings from `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Write settings to `path` atomically.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let body = toml::to_string_pretty(config).context("Failed to serialize config")?;
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        }
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, body)
        .with_context(|| format!("Failed to write config file: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace config file: {}", path.display()))?;
    Ok(())
}

/// Partial update. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub top_k: Option<usize>,
    pub similarity_threshold: Option<f32>,
    pub embedding_model: Option<String>,
    pub max_excerpt_chars: Option<usize>,
    pub tree_budget: Option<usize>,
    pub chunk_size: Option<usize>,
    pub overlap: Option<usize>,
    pub max_chunks: Option<usize>,
    pub exclude_globs: Option<Vec<String>>,
}

impl ConfigPatch {
    /// Set one field from a dotted `key` and a string value, as typed on
    /// the command line (`retrieval.top_k=12`).
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", key, value))
        }
        match key {
            "retrieval.enabled" | "enabled" => self.enabled = Some(num(key, value)?),
            "retrieval.top_k" | "top_k" => self.top_k = Some(num(key, value)?),
            "retrieval.similarity_threshold" | "similarity_threshold" => {
                self.similarity_threshold = Some(num(key, value)?)
            }
            "retrieval.max_excerpt_chars" => self.max_excerpt_chars = Some(num(key, value)?),
            "retrieval.tree_budget" => self.tree_budget = Some(num(key, value)?),
            "embedding.model" | "embedding_model" => self.embedding_model = Some(value.to_string()),
            "chunking.chunk_size" => self.chunk_size = Some(num(key, value)?),
            "chunking.overlap" => self.overlap = Some(num(key, value)?),
            "chunking.max_chunks" => self.max_chunks = Some(num(key, value)?),
            "indexing.exclude_globs" => {
                self.exclude_globs = Some(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect(),
                )
            }
            other => bail!("Unknown setting: '{}'", other),
        }
        Ok(())
    }

    pub fn apply(&self, config: &Config) -> Config {
        let mut next = config.clone();
        if let Some(v) = self.enabled {
            next.retrieval.enabled = v;
        }
        if let Some(v) = self.top_k {
            next.retrieval.top_k = v;
        }
        if let Some(v) = self.similarity_threshold {
            next.retrieval.similarity_threshold = v;
        }
        if let Some(v) = &self.embedding_model {
            next.embedding.model = v.clone();
        }
        if let Some(v) = self.max_excerpt_chars {
            next.retrieval.max_excerpt_chars = v;
        }
        if let Some(v) = self.tree_budget {
            next.retrieval.tree_budget = v;
        }
        if let Some(v) = self.chunk_size {
            next.chunking.chunk_size = v;
        }
        if let Some(v) = self.overlap {
            next.chunking.overlap = v;
        }
        if let Some(v) = self.max_chunks {
            next.chunking.max_chunks = v;
        }
        if let Some(v) = &self.exclude_globs {
            next.indexing.exclude_globs = v.clone();
        }
        next
    }
}

/// Process-wide settings, loaded once and written back on every change.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Config>,
}

impl ConfigStore {
    /// Load from `path` (defaults when the file is missing).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_config(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(config),
        })
    }

    /// Settings that are never persisted.
    pub fn ephemeral(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(config),
        }
    }

    pub fn get(&self) -> Config {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Merge, validate, persist, then publish. On any error nothing changes.
    pub fn update(&self, patch: &ConfigPatch) -> Result<Config> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let next = patch.apply(&current);
        next.validate()?;
        if let Some(path) = &self.path {
            save_config(path, &next)?;
        }
        if next.embedding.model != current.embedding.model {
            tracing::info!(
                model = %next.embedding.model,
                "embedding model changed; takes effect on next start"
            );
        }
        *current = next.clone();
        Ok(next)
    }
}
