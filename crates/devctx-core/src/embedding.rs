//! Embedding abstraction, deterministic fallback, and the cached pipeline.
//!
//! An [`EmbeddingPipeline`] owns an ordered list of [`Embedder`]
//! strategies and a bounded [`EmbeddingCache`]. Each call tries the
//! strategies in order and the first one that returns a vector of the
//! pipeline's dimension wins. The last strategy is normally the
//! [`HashEmbedder`], which cannot fail, so indexing never halts when the
//! primary model is missing or throws.
//!
//! Concrete model-backed embedders (fastembed, tract) live in the `devctx`
//! app crate.
//!
//! ```rust
//! # use std::sync::Arc;
//! # use devctx_core::embedding::{Embedder, EmbeddingCache, EmbeddingPipeline, HashEmbedder};
//! # tokio_test_block_on(async {
//! let fallback: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
//! let pipeline = EmbeddingPipeline::new(vec![fallback], EmbeddingCache::new(100, 256), 64);
//! let v = pipeline.embed("fn main() {}").await.unwrap();
//! assert_eq!(v.len(), 64);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

/// Why an embedding call produced no vector.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbeddingError {
    /// The backend is not loaded (or failed to load).
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
    /// The backend ran but inference failed.
    #[error("embedding failed: {0}")]
    Failed(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    /// Every strategy failed. Callers skip the chunk; this is never a
    /// zero vector.
    #[error("all embedding strategies failed")]
    Exhausted,
}

/// A single embedding strategy.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Strategy identifier, e.g. `"all-minilm-l6-v2"` or `"hash"`.
    fn name(&self) -> &str;
    /// Output dimensionality.
    fn dims(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

// ============ Hash fallback ============

/// Deterministic feature-hashing embedder.
///
/// Features are hashed with FNV-1a into `dims` signed buckets:
/// - character frequencies (alphanumerics, lower-cased), weight 0.25
/// - character bigrams inside words, weight 1.0
/// - whole word tokens, weight 2.0
///
/// The result is L2-normalized. Empty or symbol-only input maps to a
/// fixed unit vector, never to zeros.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub const NAME: &'static str = "hash";

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    /// Synchronous core of [`Embedder::embed`].
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();

        for ch in lower.chars().filter(|c| c.is_alphanumeric()) {
            let mut buf = [0u8; 4];
            self.add(&mut v, b'c', ch.encode_utf8(&mut buf).as_bytes(), 0.25);
        }

        for word in lower
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty())
        {
            self.add(&mut v, b'w', word.as_bytes(), 2.0);

            let chars: Vec<char> = word.chars().collect();
            for pair in chars.windows(2) {
                let bigram: String = pair.iter().collect();
                self.add(&mut v, b'b', bigram.as_bytes(), 1.0);
            }
        }

        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        l2_normalize(&mut v);
        v
    }

    fn add(&self, v: &mut [f32], family: u8, bytes: &[u8], weight: f32) {
        let mut hash = FNV_OFFSET;
        hash = fnv1a_step(hash, family);
        for b in bytes {
            hash = fnv1a_step(hash, *b);
        }
        let bucket = (hash % self.dims as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a_step(hash: u64, byte: u8) -> u64 {
    (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
}

// ============ Cache ============

struct CacheInner {
    entries: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

/// Bounded embedding cache keyed by the first `key_chars` characters of
/// the input. Inserting past `capacity` evicts the oldest insertion.
///
/// Texts sharing a key prefix share an entry.
pub struct EmbeddingCache {
    capacity: usize,
    key_chars: usize,
    inner: Mutex<CacheInner>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize, key_chars: usize) -> Self {
        Self {
            capacity,
            key_chars: key_chars.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn key(&self, text: &str) -> String {
        text.chars().take(self.key_chars).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = self.key(text);
        self.lock().entries.get(&key).cloned()
    }

    pub fn insert(&self, text: &str, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        let key = self.key(text);
        let mut inner = self.lock();
        if inner.entries.insert(key.clone(), vector).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

// ============ Pipeline ============

/// Ordered embedding strategies behind one cache.
pub struct EmbeddingPipeline {
    strategies: Vec<Arc<dyn Embedder>>,
    cache: EmbeddingCache,
    dims: usize,
    fallback_hits: AtomicU64,
}

impl EmbeddingPipeline {
    /// Strategies are tried in the given order; the first is the primary.
    pub fn new(strategies: Vec<Arc<dyn Embedder>>, cache: EmbeddingCache, dims: usize) -> Self {
        Self {
            strategies,
            cache,
            dims,
            fallback_hits: AtomicU64::new(0),
        }
    }

    /// Hash-only pipeline, used when no model backend is compiled in and
    /// in tests.
    pub fn hash_only(dims: usize, cache: EmbeddingCache) -> Self {
        Self::new(vec![Arc::new(HashEmbedder::new(dims))], cache, dims)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Name of the primary strategy.
    pub fn model_name(&self) -> &str {
        self.strategies
            .first()
            .map(|s| s.name())
            .unwrap_or(HashEmbedder::NAME)
    }

    /// Number of calls served by a strategy other than the primary.
    pub fn fallback_hits(&self) -> u64 {
        self.fallback_hits.load(Ordering::Relaxed)
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Embed `text`, or return [`EmbeddingError::Exhausted`] when every
    /// strategy fails.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit);
        }

        for (i, strategy) in self.strategies.iter().enumerate() {
            let result = strategy.embed(text).await.and_then(|v| {
                if v.len() == self.dims {
                    Ok(v)
                } else {
                    Err(EmbeddingError::Dimension {
                        expected: self.dims,
                        actual: v.len(),
                    })
                }
            });

            match result {
                Ok(vector) => {
                    if i > 0 {
                        self.fallback_hits.fetch_add(1, Ordering::Relaxed);
                    }
                    self.cache.insert(text, vector.clone());
                    return Ok(vector);
                }
                Err(e) => {
                    tracing::debug!(strategy = strategy.name(), error = %e, "embedding strategy failed");
                }
            }
        }

        tracing::warn!("all embedding strategies failed");
        Err(EmbeddingError::Exhausted)
    }
}

// ============ Vector helpers ============

/// Scale `v` to unit length in place. Near-zero vectors are left as-is.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
