//! On-disk [`Store`]: an [`InMemoryStore`] serialized whole to one JSON file.
//!
//! Reads and writes hit memory. [`Store::flush`] writes the entire table set
//! to `<path>.tmp` and renames it over `<path>`, so the file on disk is
//! always a complete earlier state. When a flush fails, the in-memory tables
//! are reloaded from that file and the error is returned; readers keep
//! seeing the last state that made it to disk.

use anyhow::{Context, Result};
use std::collections::HashSet;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use devctx_core::models::{
    FileTreeEntry, IndexedChunk, RepoMetadata, Scope, SearchHit, StoreStats, StoredEmbedding,
};
use devctx_core::store::memory::{InMemoryStore, Tables};
use devctx_core::store::Store;

pub struct SnapshotStore {
    path: PathBuf,
    inner: InMemoryStore,
    flush_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Open (or start) the snapshot at `path`. `model` is recorded as the
    /// vector source only if the snapshot holds no vectors yet.
    ///
    /// An unreadable snapshot is moved aside to `<path>.corrupt` and the
    /// store starts empty.
    pub async fn open(path: impl Into<PathBuf>, model: &str, dims: usize) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create store dir: {}", dir.display()))?;
            }
        }

        let tables = match read_tables(&path).await {
            Ok(t) => t.unwrap_or_default(),
            Err(e) => {
                let aside = path.with_extension("corrupt");
                tracing::warn!(path = %path.display(), error = %e, "snapshot unreadable, starting empty");
                if let Err(e) = tokio::fs::rename(&path, &aside).await {
                    tracing::warn!(path = %path.display(), error = %e, "could not move unreadable snapshot aside; the next flush overwrites it");
                }
                Tables::default()
            }
        };

        let inner = InMemoryStore::from_tables(tables);
        if let (Some(stored_model), Some(stored_dims)) = inner.vector_space() {
            if stored_model != model || stored_dims != dims {
                tracing::warn!(
                    stored_model = %stored_model,
                    stored_dims,
                    model,
                    dims,
                    "index was built with a different embedding model; re-index for accurate results"
                );
            }
        }
        inner.set_writer_model(model);
        tracing::debug!(path = %path.display(), "snapshot store opened");
        Ok(Self {
            path,
            inner,
            flush_lock: Mutex::new(()),
        })
    }

    async fn write_snapshot(&self) -> Result<()> {
        let bytes = self.inner.snapshot().to_json()?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write snapshot: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace snapshot: {}", self.path.display()))?;
        Ok(())
    }
}

async fn read_tables(path: &Path) -> Result<Option<Tables>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(Tables::from_json(&bytes).with_context(|| {
            format!("Failed to parse snapshot: {}", path.display())
        })?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read snapshot: {}", path.display())),
    }
}

#[async_trait]
impl Store for SnapshotStore {
    async fn delete_file(&self, scope: &Scope, file_path: &str) -> Result<usize> {
        self.inner.delete_file(scope, file_path).await
    }

    async fn insert_chunks(&self, rows: Vec<(IndexedChunk, StoredEmbedding)>) -> Result<()> {
        self.inner.insert_chunks(rows).await
    }

    async fn retain_files(&self, scope: &Scope, keep: &HashSet<String>) -> Result<usize> {
        self.inner.retain_files(scope, keep).await
    }

    async fn replace_file_tree(&self, scope: &Scope, entries: Vec<FileTreeEntry>) -> Result<()> {
        self.inner.replace_file_tree(scope, entries).await
    }

    async fn upsert_repo_metadata(&self, meta: RepoMetadata) -> Result<()> {
        self.inner.upsert_repo_metadata(meta).await
    }

    async fn similarity_search(
        &self,
        scope: &Scope,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<SearchHit>> {
        self.inner
            .similarity_search(scope, query, top_k, min_similarity)
            .await
    }

    async fn file_tree(&self, scope: &Scope) -> Result<Vec<FileTreeEntry>> {
        self.inner.file_tree(scope).await
    }

    async fn repo_metadata(&self, scope: &Scope) -> Result<Option<RepoMetadata>> {
        self.inner.repo_metadata(scope).await
    }

    async fn stats(&self, scope: Option<&Scope>) -> Result<StoreStats> {
        self.inner.stats(scope).await
    }

    async fn scopes(&self) -> Result<Vec<Scope>> {
        self.inner.scopes().await
    }

    async fn clear_scope(&self, scope: &Scope) -> Result<()> {
        self.inner.clear_scope(scope).await
    }

    async fn clear_all(&self) -> Result<()> {
        self.inner.clear_all().await
    }

    async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        match self.write_snapshot().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %format!("{:#}", e), "snapshot flush failed, reverting to last flushed state");
                match read_tables(&self.path).await {
                    Ok(t) => self.inner.restore(t.unwrap_or_default()),
                    Err(reload) => {
                        tracing::error!(error = %format!("{:#}", reload), "could not reload last snapshot")
                    }
                }
                Err(e)
            }
        }
    }
}
