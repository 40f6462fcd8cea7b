//! Store-level mutations that make up one indexing run.
//!
//! Each function here is one logical mutation and ends with
//! [`Store::flush`]. A failed flush surfaces as a store error; everything
//! else that can go wrong with a single file is reported so the caller can
//! skip it and move on.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use uuid::Uuid;

use crate::chunk::{chunk_text, content_hash, ChunkParams};
use crate::embedding::EmbeddingPipeline;
use crate::models::{IndexedChunk, RepoInfo, RepoMetadata, Scope, StoredEmbedding};
use crate::store::Store;
use crate::tree::file_tree_entries;

/// Why [`index_file`] could not write a file.
#[derive(Debug, thiserror::Error)]
pub enum IndexFileError {
    /// No chunk of the file could be embedded. The file's old rows are
    /// already gone; the file is simply absent from the index.
    #[error("no chunk could be embedded")]
    EmbeddingExhausted,
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// What [`index_file`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileIndexSummary {
    /// Chunks from a previous run that were deleted first.
    pub replaced: usize,
    pub chunks_written: usize,
    /// Chunks dropped because every embedding strategy failed.
    pub chunks_skipped: usize,
    /// The chunk ceiling cut the file short.
    pub truncated: bool,
}

/// Replace the chunk set for `(scope, file_path)` with `content`.
///
/// Old rows are deleted, the new content is chunked and embedded one chunk
/// at a time, then the embedded chunks are inserted and the store flushed.
/// Readers running concurrently may briefly see neither the old nor the new
/// set.
pub async fn index_file<S: Store + ?Sized>(
    store: &S,
    pipeline: &EmbeddingPipeline,
    params: &ChunkParams,
    scope: &Scope,
    file_path: &str,
    content: &str,
    last_modified: i64,
) -> Result<FileIndexSummary, IndexFileError> {
    let replaced = store.delete_file(scope, file_path).await?;

    let pieces = chunk_text(content, params);
    let total_chars = content.chars().count();
    let truncated = pieces.last().is_some_and(|c| c.end < total_chars);

    let mut rows = Vec::with_capacity(pieces.len());
    let mut skipped = 0usize;
    for piece in pieces {
        let vector = match pipeline.embed(&piece.text).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%scope, file = file_path, chunk = piece.index, error = %e, "chunk skipped");
                skipped += 1;
                continue;
            }
        };

        let id = Uuid::new_v4().to_string();
        let chunk = IndexedChunk {
            id: id.clone(),
            scope: scope.clone(),
            file_path: file_path.to_string(),
            hash: content_hash(&piece.text),
            content: piece.text,
            chunk_index: piece.index,
            start: piece.start,
            end: piece.end,
            last_modified,
            embedding_dimension: vector.len(),
        };
        rows.push((
            chunk,
            StoredEmbedding {
                chunk_id: id,
                vector,
            },
        ));
    }

    let written = rows.len();
    if written > 0 {
        store.insert_chunks(rows).await?;
    }
    store.flush().await?;

    if written == 0 && skipped > 0 {
        return Err(IndexFileError::EmbeddingExhausted);
    }

    tracing::debug!(%scope, file = file_path, chunks = written, replaced, "file indexed");
    Ok(FileIndexSummary {
        replaced,
        chunks_written: written,
        chunks_skipped: skipped,
        truncated,
    })
}

/// Rebuild the tree rows for `scope` from the discovered file list.
///
/// Paths under `root` are made relative to it first; paths that are already
/// relative are kept. Returns the number of entries written.
pub async fn build_file_tree<S: Store + ?Sized>(
    store: &S,
    scope: &Scope,
    files: &[String],
    root: &str,
) -> anyhow::Result<usize> {
    let relative: Vec<String> = files
        .iter()
        .map(|f| relative_to(f, root))
        .filter(|f| !f.is_empty())
        .collect();
    let entries = file_tree_entries(scope, &relative, Utc::now().timestamp());
    let count = entries.len();
    store.replace_file_tree(scope, entries).await?;
    store.flush().await?;
    Ok(count)
}

/// Drop the chunks of every file in `scope` that is not in `present`, the
/// full list of files a completed run discovered. Returns the number of
/// chunks removed.
pub async fn remove_missing_files<S: Store + ?Sized>(
    store: &S,
    scope: &Scope,
    present: &[String],
) -> anyhow::Result<usize> {
    let keep: HashSet<String> = present.iter().cloned().collect();
    let removed = store.retain_files(scope, &keep).await?;
    if removed > 0 {
        tracing::info!(%scope, chunks = removed, "removed chunks of deleted files");
        store.flush().await?;
    }
    Ok(removed)
}

/// Record VCS facts for `scope`, stamped with the current time.
pub async fn upsert_repo_metadata<S: Store + ?Sized>(
    store: &S,
    scope: &Scope,
    info: RepoInfo,
) -> anyhow::Result<()> {
    store
        .upsert_repo_metadata(RepoMetadata {
            scope: scope.clone(),
            info,
            last_indexed: Utc::now().timestamp(),
        })
        .await?;
    store.flush().await
}

fn relative_to(path: &str, root: &str) -> String {
    let rel = Path::new(path)
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string());
    rel.replace('\\', "/").trim_start_matches("./").trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::embedding::{Embedder, EmbeddingCache, EmbeddingError};
    use crate::store::memory::InMemoryStore;

    fn pipeline() -> EmbeddingPipeline {
        EmbeddingPipeline::hash_only(32, EmbeddingCache::new(100, 64))
    }

    struct Broken;

    #[async_trait]
    impl Embedder for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn dims(&self) -> usize {
            32
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Failed("boom".into()))
        }
    }

    #[tokio::test]
    async fn test_reindex_identical_content_no_duplicates() {
        let store = InMemoryStore::new();
        let p = pipeline();
        let scope = Scope::project("/p");
        let params = ChunkParams::new(100, 20, 50);
        let text = "fn main() { println!(\"hi\"); }\n".repeat(20);

        let first = index_file(&store, &p, &params, &scope, "main.rs", &text, 0)
            .await
            .unwrap();
        let before = store.stats(Some(&scope)).await.unwrap();
        let second = index_file(&store, &p, &params, &scope, "main.rs", &text, 0)
            .await
            .unwrap();
        let after = store.stats(Some(&scope)).await.unwrap();

        assert_eq!(before, after);
        assert_eq!(second.replaced, first.chunks_written);
        assert_eq!(after.total_chunks, after.total_embeddings);
    }

    #[tokio::test]
    async fn test_three_small_files_three_chunks() {
        let store = InMemoryStore::new();
        let p = pipeline();
        let scope = Scope::project("/p");
        for name in ["a.rs", "b.rs", "c.rs"] {
            index_file(&store, &p, &ChunkParams::default(), &scope, name, "short", 0)
                .await
                .unwrap();
        }
        let stats = store.stats(None).await.unwrap();
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.total_embeddings, 3);
    }

    #[tokio::test]
    async fn test_truncated_flag_when_ceiling_hit() {
        let store = InMemoryStore::new();
        let p = pipeline();
        let scope = Scope::project("/p");
        let text = "y".repeat(1000);
        let summary = index_file(&store, &p, &ChunkParams::new(100, 0, 3), &scope, "big.txt", &text, 0)
            .await
            .unwrap();
        assert!(summary.truncated);
        assert_eq!(summary.chunks_written, 3);

        let whole = index_file(&store, &p, &ChunkParams::new(100, 0, 10), &scope, "big.txt", &text, 0)
            .await
            .unwrap();
        assert!(!whole.truncated);
    }

    #[tokio::test]
    async fn test_exhausted_embedding_skips_file() {
        let store = InMemoryStore::new();
        let p = EmbeddingPipeline::new(vec![Arc::new(Broken)], EmbeddingCache::new(10, 64), 32);
        let scope = Scope::project("/p");
        let err = index_file(&store, &p, &ChunkParams::default(), &scope, "x.rs", "content", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexFileError::EmbeddingExhausted));
        assert_eq!(store.stats(None).await.unwrap().total_chunks, 0);
    }

    #[tokio::test]
    async fn test_build_file_tree_relativizes_and_replaces() {
        let store = InMemoryStore::new();
        let scope = Scope::project("/root/app");
        let files = vec!["/root/app/src/main.rs".to_string(), "README.md".to_string()];
        let n = build_file_tree(&store, &scope, &files, "/root/app").await.unwrap();
        // src/, src/main.rs, README.md
        assert_eq!(n, 3);

        build_file_tree(&store, &scope, &["lib.rs".to_string()], "/root/app")
            .await
            .unwrap();
        let tree = store.file_tree(&scope).await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].path, "lib.rs");
    }

    #[tokio::test]
    async fn test_remove_missing_files() {
        let store = InMemoryStore::new();
        let p = pipeline();
        let scope = Scope::project("/p");
        for name in ["a.rs", "gone.rs"] {
            index_file(&store, &p, &ChunkParams::default(), &scope, name, "fn x() {}", 0)
                .await
                .unwrap();
        }
        let removed = remove_missing_files(&store, &scope, &["a.rs".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let stats = store.stats(Some(&scope)).await.unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_embeddings, 1);
    }
}
