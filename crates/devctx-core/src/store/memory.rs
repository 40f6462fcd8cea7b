//! In-memory [`Store`] implementation.
//!
//! All rows live in one [`Tables`] value behind a `std::sync::RwLock`.
//! Similarity search is brute-force cosine over the scope's embeddings.
//! [`Tables`] is serde-serializable so the app crate can snapshot the whole
//! store to disk and restore it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::cosine_similarity;
use crate::models::{
    FileTreeEntry, IndexedChunk, RepoMetadata, Scope, SearchHit, StoreStats, StoredEmbedding,
};

use super::Store;

/// Bumped when the snapshot layout changes incompatibly.
pub const TABLES_FORMAT: u32 = 1;

/// Every table, as one serializable value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    pub format: u32,
    /// Model that produced the stored vectors. Set together with
    /// `dimension` by the first vector written while no vectors are stored.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dimension: Option<usize>,
    #[serde(default)]
    pub chunks: Vec<IndexedChunk>,
    #[serde(default)]
    pub embeddings: Vec<StoredEmbedding>,
    #[serde(default)]
    pub tree: Vec<FileTreeEntry>,
    #[serde(default)]
    pub repos: Vec<RepoMetadata>,
}

impl Tables {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn stats(&self, scope: Option<&Scope>) -> StoreStats {
        let in_scope = |s: &Scope| scope.map_or(true, |want| want == s);
        let chunk_ids: BTreeSet<&str> = self
            .chunks
            .iter()
            .filter(|c| in_scope(&c.scope))
            .map(|c| c.id.as_str())
            .collect();
        StoreStats {
            total_chunks: chunk_ids.len(),
            total_embeddings: self
                .embeddings
                .iter()
                .filter(|e| chunk_ids.contains(e.chunk_id.as_str()))
                .count(),
            total_tree_entries: self.tree.iter().filter(|t| in_scope(&t.scope)).count(),
            total_repos: self.repos.iter().filter(|r| in_scope(&r.scope)).count(),
        }
    }
}

/// In-memory store. Also the working set behind the on-disk snapshot store.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    writer_model: Mutex<Option<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::from_tables(Tables::default())
    }

    pub fn from_tables(mut tables: Tables) -> Self {
        tables.format = TABLES_FORMAT;
        Self {
            tables: RwLock::new(tables),
            writer_model: Mutex::new(None),
        }
    }

    /// Copy of every table.
    pub fn snapshot(&self) -> Tables {
        self.read().clone()
    }

    /// Replace every table with `tables`.
    pub fn restore(&self, mut tables: Tables) {
        tables.format = TABLES_FORMAT;
        *self.write() = tables;
    }

    /// Model name and dimension recorded by the first stored vectors.
    pub fn vector_space(&self) -> (Option<String>, Option<usize>) {
        let t = self.read();
        (t.model.clone(), t.dimension)
    }

    /// Name the model that produces newly inserted vectors. It is recorded
    /// in the tables only when a vector goes into a store holding none; an
    /// existing record is left alone.
    pub fn set_writer_model(&self, model: &str) {
        *self.writer_model.lock().unwrap_or_else(|e| e.into_inner()) = Some(model.to_string());
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn delete_file(&self, scope: &Scope, file_path: &str) -> Result<usize> {
        let mut t = self.write();
        let doomed: BTreeSet<String> = t
            .chunks
            .iter()
            .filter(|c| &c.scope == scope && c.file_path == file_path)
            .map(|c| c.id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        t.chunks.retain(|c| !doomed.contains(&c.id));
        t.embeddings.retain(|e| !doomed.contains(&e.chunk_id));
        Ok(doomed.len())
    }

    async fn insert_chunks(&self, rows: Vec<(IndexedChunk, StoredEmbedding)>) -> Result<()> {
        let writer = self
            .writer_model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut t = self.write();
        for (chunk, embedding) in rows {
            if t.embeddings.is_empty() {
                t.dimension = Some(embedding.vector.len());
                t.model = writer.clone();
            }
            t.chunks.push(chunk);
            t.embeddings.push(embedding);
        }
        Ok(())
    }

    async fn retain_files(&self, scope: &Scope, keep: &HashSet<String>) -> Result<usize> {
        let mut t = self.write();
        let doomed: BTreeSet<String> = t
            .chunks
            .iter()
            .filter(|c| &c.scope == scope && !keep.contains(&c.file_path))
            .map(|c| c.id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        t.chunks.retain(|c| !doomed.contains(&c.id));
        t.embeddings.retain(|e| !doomed.contains(&e.chunk_id));
        Ok(doomed.len())
    }

    async fn replace_file_tree(&self, scope: &Scope, entries: Vec<FileTreeEntry>) -> Result<()> {
        let mut t = self.write();
        t.tree.retain(|e| &e.scope != scope);
        t.tree
            .extend(entries.into_iter().filter(|e| &e.scope == scope));
        Ok(())
    }

    async fn upsert_repo_metadata(&self, meta: RepoMetadata) -> Result<()> {
        let mut t = self.write();
        match t.repos.iter_mut().find(|r| r.scope == meta.scope) {
            Some(existing) => *existing = meta,
            None => t.repos.push(meta),
        }
        Ok(())
    }

    async fn similarity_search(
        &self,
        scope: &Scope,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let t = self.read();
        let candidates: HashMap<&str, &IndexedChunk> = t
            .chunks
            .iter()
            .filter(|c| &c.scope == scope)
            .map(|c| (c.id.as_str(), c))
            .collect();

        let mut hits: Vec<SearchHit> = t
            .embeddings
            .iter()
            .filter(|e| e.vector.len() == query.len())
            .filter_map(|e| {
                let chunk = candidates.get(e.chunk_id.as_str())?;
                let similarity = cosine_similarity(query, &e.vector);
                if !similarity.is_finite() || similarity < min_similarity {
                    return None;
                }
                Some(SearchHit {
                    chunk_id: chunk.id.clone(),
                    file_path: chunk.file_path.clone(),
                    chunk_index: chunk.chunk_index,
                    start: chunk.start,
                    end: chunk.end,
                    content: chunk.content.clone(),
                    similarity,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file_path.cmp(&b.file_path))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn file_tree(&self, scope: &Scope) -> Result<Vec<FileTreeEntry>> {
        let t = self.read();
        let mut entries: Vec<FileTreeEntry> =
            t.tree.iter().filter(|e| &e.scope == scope).cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn repo_metadata(&self, scope: &Scope) -> Result<Option<RepoMetadata>> {
        Ok(self.read().repos.iter().find(|r| &r.scope == scope).cloned())
    }

    async fn stats(&self, scope: Option<&Scope>) -> Result<StoreStats> {
        Ok(self.read().stats(scope))
    }

    async fn scopes(&self) -> Result<Vec<Scope>> {
        let t = self.read();
        let set: BTreeSet<Scope> = t
            .chunks
            .iter()
            .map(|c| c.scope.clone())
            .chain(t.tree.iter().map(|e| e.scope.clone()))
            .chain(t.repos.iter().map(|r| r.scope.clone()))
            .collect();
        Ok(set.into_iter().collect())
    }

    async fn clear_scope(&self, scope: &Scope) -> Result<()> {
        let mut t = self.write();
        let doomed: BTreeSet<String> = t
            .chunks
            .iter()
            .filter(|c| &c.scope == scope)
            .map(|c| c.id.clone())
            .collect();
        t.chunks.retain(|c| &c.scope != scope);
        t.embeddings.retain(|e| !doomed.contains(&e.chunk_id));
        t.tree.retain(|e| &e.scope != scope);
        t.repos.retain(|r| &r.scope != scope);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        *self.write() = Tables {
            format: TABLES_FORMAT,
            ..Tables::default()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(scope: &Scope, path: &str, index: usize, content: &str) -> IndexedChunk {
        IndexedChunk {
            id: format!("{}#{}#{}", scope, path, index),
            scope: scope.clone(),
            file_path: path.to_string(),
            content: content.to_string(),
            chunk_index: index,
            start: 0,
            end: content.chars().count(),
            hash: crate::chunk::content_hash(content),
            last_modified: 0,
            embedding_dimension: 3,
        }
    }

    fn row(c: IndexedChunk, v: Vec<f32>) -> (IndexedChunk, StoredEmbedding) {
        let e = StoredEmbedding {
            chunk_id: c.id.clone(),
            vector: v,
        };
        (c, e)
    }

    #[tokio::test]
    async fn test_search_orders_and_thresholds() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        store
            .insert_chunks(vec![
                row(chunk(&a, "x.rs", 0, "x"), vec![1.0, 0.0, 0.0]),
                row(chunk(&a, "y.rs", 0, "y"), vec![0.7, 0.7, 0.0]),
                row(chunk(&a, "z.rs", 0, "z"), vec![0.0, 0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .similarity_search(&a, &[1.0, 0.1, 0.0], 10, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].file_path, "x.rs");
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert!(hits.iter().all(|h| h.similarity >= 0.5));

        let top1 = store
            .similarity_search(&a, &[1.0, 0.1, 0.0], 1, -1.0)
            .await
            .unwrap();
        assert_eq!(top1.len(), 1);
    }

    #[tokio::test]
    async fn test_search_never_crosses_scopes() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        let b = Scope::container("b");
        store
            .insert_chunks(vec![row(chunk(&a, "x.rs", 0, "x"), vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        let hits = store
            .similarity_search(&b, &[1.0, 0.0, 0.0], 10, -1.0)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_skips_mismatched_dimension() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        store
            .insert_chunks(vec![
                row(chunk(&a, "x.rs", 0, "x"), vec![1.0, 0.0]),
                row(chunk(&a, "y.rs", 0, "y"), vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();
        let hits = store
            .similarity_search(&a, &[1.0, 0.0, 0.0], 10, -1.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "y.rs");
    }

    #[tokio::test]
    async fn test_chunk_without_embedding_not_returned() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        let (c, _) = row(chunk(&a, "x.rs", 0, "x"), vec![1.0]);
        store.write().chunks.push(c);
        let hits = store.similarity_search(&a, &[1.0], 10, -1.0).await.unwrap();
        assert!(hits.is_empty());
        let stats = store.stats(Some(&a)).await.unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_embeddings, 0);
    }

    #[tokio::test]
    async fn test_delete_file_only_touches_that_file() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        let b = Scope::project("/b");
        store
            .insert_chunks(vec![
                row(chunk(&a, "x.rs", 0, "x0"), vec![1.0]),
                row(chunk(&a, "x.rs", 1, "x1"), vec![1.0]),
                row(chunk(&a, "y.rs", 0, "y"), vec![1.0]),
                row(chunk(&b, "x.rs", 0, "bx"), vec![1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.delete_file(&a, "x.rs").await.unwrap(), 2);
        assert_eq!(store.stats(Some(&a)).await.unwrap().total_chunks, 1);
        assert_eq!(store.stats(Some(&b)).await.unwrap().total_chunks, 1);
        assert_eq!(store.stats(None).await.unwrap().total_embeddings, 2);
    }

    #[tokio::test]
    async fn test_repo_metadata_upsert_single_row() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        for branch in ["main", "dev"] {
            store
                .upsert_repo_metadata(RepoMetadata {
                    scope: a.clone(),
                    info: crate::models::RepoInfo {
                        branch: Some(branch.into()),
                        ..Default::default()
                    },
                    last_indexed: 1,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.stats(None).await.unwrap().total_repos, 1);
        let meta = store.repo_metadata(&a).await.unwrap().unwrap();
        assert_eq!(meta.info.branch.as_deref(), Some("dev"));
    }

    #[tokio::test]
    async fn test_clear_scope_leaves_others() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        let b = Scope::container("b");
        store
            .insert_chunks(vec![
                row(chunk(&a, "x.rs", 0, "x"), vec![1.0]),
                row(chunk(&b, "x.rs", 0, "x"), vec![1.0]),
            ])
            .await
            .unwrap();
        store.clear_scope(&a).await.unwrap();
        assert_eq!(store.stats(Some(&a)).await.unwrap(), StoreStats::default());
        assert_eq!(store.stats(Some(&b)).await.unwrap().total_chunks, 1);
        assert_eq!(store.scopes().await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_tables_json_roundtrip_through_restore() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        store
            .insert_chunks(vec![row(chunk(&a, "x.rs", 0, "x"), vec![0.5, 0.5])])
            .await
            .unwrap();
        let bytes = store.snapshot().to_json().unwrap();
        let other = InMemoryStore::new();
        other.restore(Tables::from_json(&bytes).unwrap());
        assert_eq!(other.snapshot(), store.snapshot());
        assert_eq!(other.vector_space().1, Some(2));
    }

    #[tokio::test]
    async fn test_retain_files_drops_only_missing_files_of_scope() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        let b = Scope::project("/b");
        store
            .insert_chunks(vec![
                row(chunk(&a, "keep.rs", 0, "k"), vec![1.0]),
                row(chunk(&a, "gone.rs", 0, "g0"), vec![1.0]),
                row(chunk(&a, "gone.rs", 1, "g1"), vec![1.0]),
                row(chunk(&b, "gone.rs", 0, "bg"), vec![1.0]),
            ])
            .await
            .unwrap();
        let keep: HashSet<String> = ["keep.rs".to_string()].into_iter().collect();
        assert_eq!(store.retain_files(&a, &keep).await.unwrap(), 2);

        let hits = store.similarity_search(&a, &[1.0], 10, -1.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "keep.rs");
        assert_eq!(store.stats(Some(&b)).await.unwrap().total_chunks, 1);
        assert_eq!(store.stats(None).await.unwrap().total_embeddings, 2);
    }

    #[tokio::test]
    async fn test_model_recorded_by_first_vector_only() {
        let store = InMemoryStore::new();
        let a = Scope::project("/a");
        store.set_writer_model("hash");
        assert_eq!(store.vector_space(), (None, None));

        store
            .insert_chunks(vec![row(chunk(&a, "x.rs", 0, "x"), vec![1.0, 0.0])])
            .await
            .unwrap();
        store.set_writer_model("all-minilm-l6-v2");
        store
            .insert_chunks(vec![row(chunk(&a, "y.rs", 0, "y"), vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.vector_space(), (Some("hash".to_string()), Some(2)));

        store.clear_all().await.unwrap();
        assert_eq!(store.vector_space(), (None, None));
        store
            .insert_chunks(vec![row(chunk(&a, "z.rs", 0, "z"), vec![1.0])])
            .await
            .unwrap();
        assert_eq!(
            store.vector_space(),
            (Some("all-minilm-l6-v2".to_string()), Some(1))
        );
    }
}
