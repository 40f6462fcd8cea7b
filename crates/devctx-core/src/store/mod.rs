//! Storage abstraction for devctx.
//!
//! The [`Store`] trait defines the row-level operations the indexing and
//! retrieval paths need. Primitive operations never flush; the
//! higher-level operations in [`crate::index`] (and `clear_*` callers)
//! finish with an explicit [`Store::flush`], so a durable backend
//! persists once per logical mutation.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    FileTreeEntry, IndexedChunk, RepoMetadata, Scope, SearchHit, StoreStats, StoredEmbedding,
};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`delete_file`](Store::delete_file) | Drop every chunk and embedding for one file |
/// | [`insert_chunks`](Store::insert_chunks) | Insert chunks with their embeddings |
/// | [`retain_files`](Store::retain_files) | Drop chunks of files no longer present |
/// | [`replace_file_tree`](Store::replace_file_tree) | Delete-all / insert-all tree rows for a scope |
/// | [`upsert_repo_metadata`](Store::upsert_repo_metadata) | One metadata row per scope |
/// | [`similarity_search`](Store::similarity_search) | Scope-filtered cosine ranking |
/// | [`flush`](Store::flush) | Persist current state (no-op in memory) |
#[async_trait]
pub trait Store: Send + Sync {
    /// Delete every chunk (and its embedding) for `(scope, file_path)`.
    /// Returns the number of chunks removed.
    async fn delete_file(&self, scope: &Scope, file_path: &str) -> Result<usize>;

    /// Insert chunks, each with its embedding.
    async fn insert_chunks(&self, rows: Vec<(IndexedChunk, StoredEmbedding)>) -> Result<()>;

    /// Delete every chunk (and its embedding) of `scope` whose file path is
    /// not in `keep`. Returns the number of chunks removed.
    async fn retain_files(&self, scope: &Scope, keep: &HashSet<String>) -> Result<usize>;

    /// Replace all tree rows for `scope` with `entries`.
    async fn replace_file_tree(&self, scope: &Scope, entries: Vec<FileTreeEntry>) -> Result<()>;

    /// Insert or replace the metadata row for `meta.scope`.
    async fn upsert_repo_metadata(&self, meta: RepoMetadata) -> Result<()>;

    /// Rank `scope`'s embedded chunks by cosine similarity to `query`.
    ///
    /// Results are ordered by descending similarity, all `>= min_similarity`,
    /// at most `top_k` long. Chunks without an embedding, and embeddings
    /// whose dimension differs from `query`, are never returned.
    async fn similarity_search(
        &self,
        scope: &Scope,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<SearchHit>>;

    async fn file_tree(&self, scope: &Scope) -> Result<Vec<FileTreeEntry>>;

    async fn repo_metadata(&self, scope: &Scope) -> Result<Option<RepoMetadata>>;

    /// Row counts for one scope, or for the whole store when `None`.
    async fn stats(&self, scope: Option<&Scope>) -> Result<StoreStats>;

    /// Every scope with at least one row of any kind.
    async fn scopes(&self) -> Result<Vec<Scope>>;

    async fn clear_scope(&self, scope: &Scope) -> Result<()>;

    async fn clear_all(&self) -> Result<()>;

    /// Persist the current state.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
