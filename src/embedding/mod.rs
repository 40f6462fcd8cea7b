//! Primary embedding model and pipeline construction.
//!
//! The primary model runs locally: fastembed on primary platforms
//! (`local-embeddings-fastembed`, default) or tract on musl / Intel Mac
//! (`local-embeddings-tract`). It is loaded once, in the background, when
//! the engine starts; calls made before the load finishes wait for it.
//! When neither feature is enabled, or the load fails, the primary reports
//! [`EmbeddingError::Unavailable`] and the hash fallback serves every call.
//!
//! # Supported models
//!
//! | Name | Dims |
//! |------|------|
//! | `all-minilm-l6-v2` | 384 |
//! | `bge-small-en-v1.5` | 384 |
//! | `bge-base-en-v1.5` | 768 |
//! | `bge-large-en-v1.5` | 1024 |
//! | `nomic-embed-text-v1`, `nomic-embed-text-v1.5` | 768 |
//! | `multilingual-e5-small` / `-base` / `-large` | 384 / 768 / 1024 |

#[cfg(feature = "local-embeddings-tract")]
mod local_tract;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;

use devctx_core::embedding::{
    Embedder, EmbeddingCache, EmbeddingError, EmbeddingPipeline, HashEmbedder,
};

use crate::config::EmbeddingConfig;

/// Native dimension of a known model.
pub fn known_model_dims(name: &str) -> Option<usize> {
    Some(match name {
        "all-minilm-l6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => 384,
        "bge-base-en-v1.5" | "multilingual-e5-base" => 768,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => return None,
    })
}

/// Vector dimension for a config: the model's native one when known.
pub fn effective_dims(config: &EmbeddingConfig) -> usize {
    match known_model_dims(&config.model) {
        Some(native) => {
            if native != config.dims {
                tracing::warn!(
                    model = %config.model,
                    native,
                    configured = config.dims,
                    "embedding.dims does not match the model; using the model's dimension"
                );
            }
            native
        }
        None => config.dims,
    }
}

enum Backend {
    #[cfg(feature = "local-embeddings-fastembed")]
    FastEmbed(std::sync::Mutex<fastembed::TextEmbedding>),
    #[cfg(feature = "local-embeddings-tract")]
    Tract(local_tract::TractModel),
}

impl Backend {
    /// Blocking inference for one text.
    #[allow(unused_variables)]
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match *self {
            #[cfg(feature = "local-embeddings-fastembed")]
            Backend::FastEmbed(ref model) => {
                let mut model = model.lock().unwrap_or_else(|e| e.into_inner());
                let mut out = model
                    .embed(vec![text.to_string()], None)
                    .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))?;
                out.pop()
                    .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
            }
            #[cfg(feature = "local-embeddings-tract")]
            Backend::Tract(ref model) => model.embed(text),
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => anyhow::bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn load_backend(name: &str) -> Result<Backend> {
    let model = config_to_fastembed_model(name)?;
    let embedder = fastembed::TextEmbedding::try_new(
        fastembed::InitOptions::new(model).with_show_download_progress(false),
    )
    .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
    Ok(Backend::FastEmbed(std::sync::Mutex::new(embedder)))
}

#[cfg(all(
    feature = "local-embeddings-tract",
    not(feature = "local-embeddings-fastembed")
))]
fn load_backend(name: &str) -> Result<Backend> {
    Ok(Backend::Tract(local_tract::TractModel::load(name)?))
}

#[cfg(not(any(
    feature = "local-embeddings-fastembed",
    feature = "local-embeddings-tract"
)))]
fn load_backend(_name: &str) -> Result<Backend> {
    anyhow::bail!(
        "Local embedding model requires one of: --features local-embeddings-fastembed, --features local-embeddings-tract"
    )
}

/// The primary embedding strategy: a local sentence-embedding model.
pub struct LocalModel {
    name: String,
    dims: usize,
    backend: OnceCell<std::result::Result<Arc<Backend>, String>>,
}

impl LocalModel {
    /// Loads on first use.
    pub fn new(name: &str, dims: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            dims,
            backend: OnceCell::new(),
        })
    }

    /// Start loading `name` in the background. Must be called inside a
    /// tokio runtime.
    pub fn spawn(name: &str, dims: usize) -> Arc<Self> {
        let model = Self::new(name, dims);
        let loader = model.clone();
        tokio::spawn(async move {
            loader.backend().await.ok();
        });
        model
    }

    /// `Some(true)` once loaded, `Some(false)` if the load failed, `None`
    /// while still loading.
    pub fn load_state(&self) -> Option<bool> {
        self.backend.get().map(|r| r.is_ok())
    }

    async fn backend(&self) -> std::result::Result<Arc<Backend>, EmbeddingError> {
        let loaded = self
            .backend
            .get_or_init(|| async {
                let name = self.name.clone();
                let started = std::time::Instant::now();
                let result = tokio::task::spawn_blocking(move || load_backend(&name))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.map_err(|e| format!("{:#}", e)));
                match &result {
                    Ok(_) => tracing::info!(
                        model = %self.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "embedding model loaded"
                    ),
                    Err(e) => tracing::warn!(
                        model = %self.name,
                        error = %e,
                        "embedding model unavailable, using hash fallback"
                    ),
                }
                result.map(Arc::new)
            })
            .await;
        loaded
            .clone()
            .map_err(EmbeddingError::Unavailable)
    }
}

#[async_trait]
impl Embedder for LocalModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        let backend = self.backend().await?;
        let text = text.to_string();
        tokio::task::spawn_blocking(move || backend.embed(&text))
            .await
            .map_err(|e| EmbeddingError::Failed(e.to_string()))?
            .map_err(|e| EmbeddingError::Failed(format!("{:#}", e)))
    }
}

/// Build the pipeline for `config`: the local model first, the hash
/// fallback second, sharing one bounded cache. With `preload` the model
/// starts loading now; otherwise on the first embed call.
pub fn create_pipeline(config: &EmbeddingConfig, preload: bool) -> EmbeddingPipeline {
    let dims = effective_dims(config);
    let primary: Arc<dyn Embedder> = if preload {
        LocalModel::spawn(&config.model, dims)
    } else {
        LocalModel::new(&config.model, dims)
    };
    EmbeddingPipeline::new(
        vec![primary, Arc::new(HashEmbedder::new(dims))],
        EmbeddingCache::new(config.cache_size, config.cache_key_chars),
        dims,
    )
}

/// Pipeline with only the hash embedder. Used by tests and `--offline`.
pub fn create_offline_pipeline(config: &EmbeddingConfig) -> EmbeddingPipeline {
    let dims = effective_dims(config);
    EmbeddingPipeline::hash_only(
        dims,
        EmbeddingCache::new(config.cache_size, config.cache_key_chars),
    )
}
