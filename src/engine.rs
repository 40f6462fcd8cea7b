//! The context engine: one store, one embedding pipeline, one settings
//! file, and the indexing controller that ties them together.
//!
//! This is the API consumers call. Every operation takes an explicit
//! [`Scope`]; nothing is shared across scopes except the model and its
//! cache.

use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use devctx_core::context::{self, ContextOptions};
use devctx_core::embedding::EmbeddingPipeline;
use devctx_core::models::{Scope, SearchHit, StoreStats};
use devctx_core::store::Store;

use crate::access::{ContainerAccess, FileAccess, LocalAccess};
use crate::config::{Config, ConfigPatch, ConfigStore};
use crate::embedding::{create_offline_pipeline, create_pipeline};
use crate::indexer::{IndexError, IndexReport, IndexSettings, IndexingController, JobState};
use crate::snapshot_store::SnapshotStore;
use crate::status::StatusSink;

/// Store-wide totals plus the active settings.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    #[serde(flatten)]
    pub totals: StoreStats,
    pub model: String,
    pub dims: usize,
    pub store_path: Option<PathBuf>,
    pub store_bytes: u64,
    pub config: Config,
}

/// Totals for one scope.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeStats {
    pub scope: Scope,
    #[serde(flatten)]
    pub stats: StoreStats,
    /// Unix seconds of the most recent indexing run, if any.
    pub last_indexed: Option<i64>,
}

pub struct ContextEngine {
    config: ConfigStore,
    store: Arc<dyn Store>,
    store_path: Option<PathBuf>,
    pipeline: Arc<EmbeddingPipeline>,
    controller: IndexingController,
}

impl ContextEngine {
    /// Open the snapshot named in `config` and start loading the primary
    /// embedding model in the background.
    pub async fn open(config: ConfigStore) -> Result<Self> {
        let pipeline = create_pipeline(&config.get().embedding, true);
        Self::open_with_pipeline(config, pipeline).await
    }

    /// Like [`open`](Self::open) but the model loads on the first embed.
    pub async fn open_lazy(config: ConfigStore) -> Result<Self> {
        let pipeline = create_pipeline(&config.get().embedding, false);
        Self::open_with_pipeline(config, pipeline).await
    }

    /// Like [`open`](Self::open) but with only the hash embedder.
    pub async fn open_offline(config: ConfigStore) -> Result<Self> {
        let pipeline = create_offline_pipeline(&config.get().embedding);
        Self::open_with_pipeline(config, pipeline).await
    }

    async fn open_with_pipeline(config: ConfigStore, pipeline: EmbeddingPipeline) -> Result<Self> {
        let path = config.get().store.path;
        let store = SnapshotStore::open(&path, pipeline.model_name(), pipeline.dims()).await?;
        tracing::debug!(path = %path.display(), model = pipeline.model_name(), "engine opened");
        let mut engine = Self::with_parts(config, Arc::new(store), pipeline);
        engine.store_path = Some(path);
        Ok(engine)
    }

    /// Assemble an engine from explicit parts.
    pub fn with_parts(
        config: ConfigStore,
        store: Arc<dyn Store>,
        pipeline: EmbeddingPipeline,
    ) -> Self {
        let pipeline = Arc::new(pipeline);
        let controller = IndexingController::new(store.clone(), pipeline.clone());
        Self {
            config,
            store,
            store_path: None,
            pipeline,
            controller,
        }
    }

    pub fn pipeline(&self) -> &EmbeddingPipeline {
        &self.pipeline
    }

    /// Index `scope` through `access`. Rejects with [`IndexError`] when the
    /// job fails; an aborted job resolves with `outcome == Aborted`.
    pub async fn index_scope(
        &self,
        scope: &Scope,
        access: &dyn FileAccess,
        status: &dyn StatusSink,
    ) -> Result<IndexReport, IndexError> {
        let settings = IndexSettings::from_config(&self.config.get());
        self.controller
            .index_scope(scope, access, &settings, status)
            .await
    }

    /// Index a local directory under its project scope.
    pub async fn index_project(
        &self,
        root: &Path,
        status: &dyn StatusSink,
    ) -> Result<IndexReport, IndexError> {
        let root = project_root(root);
        let scope = Scope::project(root.to_string_lossy());
        self.index_scope(&scope, &LocalAccess::new(root), status)
            .await
    }

    /// Index `workdir` inside a running container under its container scope.
    pub async fn index_container(
        &self,
        container_id: &str,
        workdir: &str,
        status: &dyn StatusSink,
    ) -> Result<IndexReport, IndexError> {
        let scope = Scope::container(container_id);
        self.index_scope(&scope, &ContainerAccess::new(container_id, workdir), status)
            .await
    }

    /// Ask every running job to stop before its next file.
    pub fn abort_indexing(&self) {
        self.controller.abort_all();
    }

    pub fn job_state(&self, scope: &Scope) -> JobState {
        self.controller.state(scope)
    }

    /// Context block for `query` within `scope`, at most `max_budget`
    /// characters plus one notice line. Empty when retrieval is disabled or
    /// the scope has nothing indexed.
    pub async fn build_context(&self, query: &str, scope: &Scope, max_budget: usize) -> Result<String> {
        let config = self.config.get();
        if !config.retrieval.enabled {
            return Ok(String::new());
        }
        let opts = ContextOptions {
            top_k: config.retrieval.top_k,
            min_similarity: config.retrieval.similarity_threshold,
            max_budget,
            max_excerpt_chars: config.retrieval.max_excerpt_chars,
            tree_budget: config.retrieval.tree_budget,
            ..ContextOptions::default()
        };
        context::build_context(self.store.as_ref(), &self.pipeline, scope, query, &opts).await
    }

    /// Ranked hits without assembly. `top_k` defaults to the configured one.
    pub async fn search(&self, query: &str, scope: &Scope, top_k: Option<usize>) -> Result<Vec<SearchHit>> {
        let config = self.config.get();
        context::retrieve(
            self.store.as_ref(),
            &self.pipeline,
            scope,
            query,
            top_k.unwrap_or(config.retrieval.top_k),
            config.retrieval.similarity_threshold,
        )
        .await
    }

    pub async fn get_stats(&self) -> Result<EngineStats> {
        let totals = self.store.stats(None).await?;
        let store_bytes = match &self.store_path {
            Some(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .unwrap_or(0),
            None => 0,
        };
        Ok(EngineStats {
            totals,
            model: self.pipeline.model_name().to_string(),
            dims: self.pipeline.dims(),
            store_path: self.store_path.clone(),
            store_bytes,
            config: self.config.get(),
        })
    }

    /// Per-scope totals, ordered by scope.
    pub async fn scope_stats(&self) -> Result<Vec<ScopeStats>> {
        let mut out = Vec::new();
        for scope in self.store.scopes().await? {
            let stats = self.store.stats(Some(&scope)).await?;
            let repo_ts = self
                .store
                .repo_metadata(&scope)
                .await?
                .map(|m| m.last_indexed);
            let tree_ts = self
                .store
                .file_tree(&scope)
                .await?
                .iter()
                .map(|e| e.last_indexed)
                .max();
            out.push(ScopeStats {
                scope,
                stats,
                last_indexed: repo_ts.max(tree_ts),
            });
        }
        Ok(out)
    }

    pub fn get_config(&self) -> Config {
        self.config.get()
    }

    pub fn update_config(&self, patch: &ConfigPatch) -> Result<Config> {
        self.config.update(patch)
    }

    pub async fn clear_scope(&self, scope: &Scope) -> Result<()> {
        self.store.clear_scope(scope).await?;
        self.store.flush().await?;
        tracing::info!(%scope, "scope cleared");
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.store.clear_all().await?;
        self.store.flush().await?;
        self.pipeline.cache().clear();
        tracing::info!("index cleared");
        Ok(())
    }
}

/// Absolute form of `root` so the same directory always maps to the same
/// scope. Falls back to the path as given when it cannot be resolved.
pub fn project_root(root: &Path) -> PathBuf {
    std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::NoStatus;
    use devctx_core::embedding::EmbeddingCache;
    use devctx_core::store::memory::InMemoryStore;

    fn engine(config: Config) -> ContextEngine {
        ContextEngine::with_parts(
            ConfigStore::ephemeral(config),
            Arc::new(InMemoryStore::new()),
            EmbeddingPipeline::hash_only(128, EmbeddingCache::new(100, 256)),
        )
    }

    #[tokio::test]
    async fn test_disabled_retrieval_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "docker container lifecycle").unwrap();
        let mut config = Config::default();
        config.retrieval.similarity_threshold = -1.0;
        let engine = engine(config);
        let report = engine.index_project(dir.path(), &NoStatus).await.unwrap();
        assert_eq!(report.files_indexed, 1);

        let scope = Scope::project(project_root(dir.path()).to_string_lossy());
        assert!(!engine.build_context("docker", &scope, 4000).await.unwrap().is_empty());

        engine
            .update_config(&ConfigPatch {
                enabled: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(engine.build_context("docker", &scope, 4000).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_scope_stats_lists_indexed_scopes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        let engine = engine(Config::default());
        engine.index_project(dir.path(), &NoStatus).await.unwrap();

        let scopes = engine.scope_stats().await.unwrap();
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].stats.total_chunks, 1);
        assert!(scopes[0].last_indexed.is_some());

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.totals.total_embeddings, 1);
        assert_eq!(stats.store_bytes, 0);
        assert_eq!(stats.model, "hash");
    }
}
