//! Tract-based local embedding model (for musl and Intel Mac builds).
//!
//! Pure-Rust path: the ONNX graph runs on tract-onnx and text is tokenized
//! with the tokenizers crate. Token states are mean-pooled under the
//! attention mask and L2-normalized. The model and tokenizer are downloaded
//! once into `$HOME/.cache/devctx/models` and loaded once per process.
#![cfg_attr(
    all(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"),
    allow(dead_code)
)]

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use tract_onnx::prelude::*;

use devctx_core::embedding::l2_normalize;

const ALL_MINILM_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const ALL_MINILM_DIMS: usize = 384;
const MAX_TOKENS: usize = 256;

type RunFn = Box<dyn Fn(TVec<TValue>) -> TractResult<TVec<TValue>> + Send + Sync>;

/// Model manifest: name -> (hf repo, onnx path in repo, tokenizer path in repo, dims).
fn model_manifest(model_name: &str) -> Result<(&'static str, &'static str, &'static str, usize)> {
    match model_name {
        "all-minilm-l6-v2" => Ok((
            ALL_MINILM_REPO,
            "onnx/model.onnx",
            "tokenizer.json",
            ALL_MINILM_DIMS,
        )),
        _ => bail!(
            "Tract backend supports only all-minilm-l6-v2 for now. Requested: '{}'",
            model_name
        ),
    }
}

fn cache_dir() -> Result<PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = PathBuf::from(base).join(".cache").join("devctx").join("models");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create model cache: {}", dir.display()))?;
    Ok(dir)
}

fn download_to_cache(repo: &str, path: &str, cache_path: &Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!(
        "https://huggingface.co/{}/resolve/main/{}",
        repo,
        path.replace(' ', "%20")
    );
    tracing::info!(%url, "downloading embedding model file");
    let bytes = reqwest::blocking::get(&url)
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .with_context(|| format!("Download {}", url))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(cache_path, &bytes)
        .with_context(|| format!("Failed to write {}", cache_path.display()))?;
    Ok(())
}

pub struct TractModel {
    run: RunFn,
    tokenizer: tokenizers::Tokenizer,
    dims: usize,
}

impl TractModel {
    /// Download if needed, then load and optimize the graph. Blocking.
    pub fn load(model_name: &str) -> Result<Self> {
        let (repo, onnx_rel, tokenizer_rel, dims) = model_manifest(model_name)?;
        let model_dir = cache_dir()?.join(model_name);
        let onnx_path = model_dir.join(onnx_rel);
        let tokenizer_path = model_dir.join(tokenizer_rel);
        download_to_cache(repo, onnx_rel, &onnx_path)?;
        download_to_cache(repo, tokenizer_rel, &tokenizer_path)?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Load tokenizer: {}", e))?;

        let plan = tract_onnx::onnx()
            .model_for_path(&onnx_path)
            .map_err(|e| anyhow!("Load ONNX: {}", e))?
            .into_optimized()
            .map_err(|e| anyhow!("Optimize: {}", e))?
            .into_runnable()
            .map_err(|e| anyhow!("Build tract runnable: {}", e))?;

        Ok(Self {
            run: Box::new(move |inputs| plan.run(inputs)),
            tokenizer,
            dims,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed one text. Blocking; call from `spawn_blocking`.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenize: {}", e))?;
        let ids = encoding.get_ids();
        let len = ids.len().clamp(1, MAX_TOKENS);

        let mut input_ids = vec![0i64; len];
        let mut attention_mask = vec![0i64; len];
        for (j, &id) in ids.iter().take(len).enumerate() {
            input_ids[j] = id as i64;
            attention_mask[j] = 1;
        }
        let valid = attention_mask.iter().filter(|&&m| m == 1).count();

        let input_ids: Tensor = ndarray::Array2::from_shape_vec((1, len), input_ids)
            .map_err(|e| anyhow!("Input ids shape: {}", e))?
            .into();
        let attention_mask: Tensor = ndarray::Array2::from_shape_vec((1, len), attention_mask)
            .map_err(|e| anyhow!("Attention mask shape: {}", e))?
            .into();
        let outputs = (self.run)(tvec!(input_ids.into(), attention_mask.into()))?;

        let output = outputs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No output tensor"))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| anyhow!("Output to array: {}", e))?;

        // [1, dims] is already pooled; [1, seq, dims] is last_hidden_state.
        let shape = view.shape().to_vec();
        let mut pooled = match shape.len() {
            2 => view.iter().copied().take(self.dims).collect::<Vec<f32>>(),
            3 => {
                let mut sum = vec![0f32; self.dims];
                let rows = valid.min(shape[1]);
                for j in 0..rows {
                    for (k, &v) in view.slice(ndarray::s![0, j, ..]).iter().enumerate() {
                        if k < self.dims {
                            sum[k] += v;
                        }
                    }
                }
                if rows > 0 {
                    for x in &mut sum {
                        *x /= rows as f32;
                    }
                }
                sum
            }
            _ => bail!("Unexpected output shape: {:?}", shape),
        };
        l2_normalize(&mut pooled);
        Ok(pooled)
    }
}
