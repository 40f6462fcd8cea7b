use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use devctx::access::ContainerAccess;
use devctx::config::{Config, ConfigStore};
use devctx::engine::{project_root, ContextEngine};
use devctx::indexer::{IndexError, JobState};
use devctx::status::{IndexProgressEvent, NoStatus, StatusSink};
use devctx_core::embedding::{EmbeddingCache, EmbeddingPipeline};
use devctx_core::models::{
    FileTreeEntry, IndexedChunk, RepoMetadata, Scope, SearchHit, StoreStats, StoredEmbedding,
};
use devctx_core::store::memory::InMemoryStore;
use devctx_core::store::Store;

fn test_config() -> Config {
    let mut config = Config::default();
    config.retrieval.similarity_threshold = -1.0;
    config.indexing.yield_ms = 0;
    config
}

fn memory_engine(config: Config) -> ContextEngine {
    ContextEngine::with_parts(
        ConfigStore::ephemeral(config),
        Arc::new(InMemoryStore::new()),
        EmbeddingPipeline::hash_only(256, EmbeddingCache::new(1000, 256)),
    )
}

fn scope_of(dir: &Path) -> Scope {
    Scope::project(project_root(dir).to_string_lossy())
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (name, body) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, body).unwrap();
    }
}

#[tokio::test]
async fn test_three_small_files_give_three_chunks() {
    let dir = TempDir::new().unwrap();
    write_files(
        dir.path(),
        &[
            ("a.rs", "fn alpha() -> u32 { 1 }"),
            ("b.md", "# Beta\n\nNotes about beta."),
            ("src/c.py", "def gamma():\n    return 3\n"),
        ],
    );

    let engine = memory_engine(test_config());
    let report = engine.index_project(dir.path(), &NoStatus).await.unwrap();
    assert_eq!(report.outcome, JobState::Completed);
    assert_eq!(report.files_indexed, 3);

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.totals.total_chunks, 3);
    assert_eq!(stats.totals.total_embeddings, 3);
    // a.rs, b.md, src/, src/c.py
    assert_eq!(stats.totals.total_tree_entries, 4);
}

#[tokio::test]
async fn test_reindex_produces_no_duplicates() {
    let dir = TempDir::new().unwrap();
    let long = "let x = 1;\n".repeat(300);
    write_files(dir.path(), &[("a.rs", "fn a() {}"), ("long.rs", &long)]);

    let engine = memory_engine(test_config());
    engine.index_project(dir.path(), &NoStatus).await.unwrap();
    let first = engine.get_stats().await.unwrap().totals;
    engine.index_project(dir.path(), &NoStatus).await.unwrap();
    let second = engine.get_stats().await.unwrap().totals;

    assert!(first.total_chunks > 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_reindex_forgets_deleted_file() {
    let dir = TempDir::new().unwrap();
    write_files(dir.path(), &[("a.rs", "fn a() {}"), ("gone.rs", "fn gone() {}")]);

    let engine = memory_engine(test_config());
    engine.index_project(dir.path(), &NoStatus).await.unwrap();
    fs::remove_file(dir.path().join("gone.rs")).unwrap();
    let report = engine.index_project(dir.path(), &NoStatus).await.unwrap();
    assert_eq!(report.files_discovered, 1);
    assert_eq!(report.chunks_removed, 1);

    let scope = scope_of(dir.path());
    let hits = engine.search("fn gone", &scope, Some(10)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].file_path, "a.rs");
    let block = engine.build_context("fn gone", &scope, 4000).await.unwrap();
    assert!(block.contains("a.rs"));
    assert!(!block.contains("gone.rs"));
}

#[tokio::test]
async fn test_docker_query_ranks_docker_file_first() {
    let dir = TempDir::new().unwrap();
    write_files(
        dir.path(),
        &[
            (
                "docker.md",
                "Use these commands to start, stop, and restart a Docker container.",
            ),
            (
                "garden.md",
                "Gardening tips: water tomatoes in the morning and mulch the beds.",
            ),
        ],
    );

    let engine = memory_engine(test_config());
    engine.index_project(dir.path(), &NoStatus).await.unwrap();

    let hits = engine
        .search("Docker container lifecycle", &scope_of(dir.path()), None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].file_path, "docker.md");
    assert!(hits[0].similarity > hits[1].similarity);
}

#[tokio::test]
async fn test_scopes_never_mix() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_files(a.path(), &[("same.rs", "fn shared_name() {}")]);
    write_files(b.path(), &[("same.rs", "fn shared_name() {}"), ("other.rs", "fn other() {}")]);

    let engine = memory_engine(test_config());
    engine.index_project(a.path(), &NoStatus).await.unwrap();
    engine.index_project(b.path(), &NoStatus).await.unwrap();

    let scope_a = scope_of(a.path());
    let scope_b = scope_of(b.path());
    let hits_a = engine.search("shared_name", &scope_a, Some(10)).await.unwrap();
    let hits_b = engine.search("shared_name", &scope_b, Some(10)).await.unwrap();
    assert_eq!(hits_a.len(), 1);
    assert_eq!(hits_b.len(), 2);

    // Same identifier as a container scope is a different scope.
    let container = Scope::container(project_root(a.path()).to_string_lossy());
    assert!(engine.search("shared_name", &container, Some(10)).await.unwrap().is_empty());
    assert_eq!(engine.build_context("shared_name", &container, 4000).await.unwrap(), "");
}

#[tokio::test]
async fn test_clear_scope_leaves_other_scope() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write_files(a.path(), &[("a.rs", "fn a() {}")]);
    write_files(b.path(), &[("b.rs", "fn b() {}"), ("c.rs", "fn c() {}")]);

    let engine = memory_engine(test_config());
    engine.index_project(a.path(), &NoStatus).await.unwrap();
    engine.index_project(b.path(), &NoStatus).await.unwrap();

    engine.clear_scope(&scope_of(a.path())).await.unwrap();

    let scopes = engine.scope_stats().await.unwrap();
    assert_eq!(scopes.len(), 1);
    assert_eq!(scopes[0].scope, scope_of(b.path()));
    assert_eq!(scopes[0].stats.total_chunks, 2);

    engine.clear_all().await.unwrap();
    assert_eq!(engine.get_stats().await.unwrap().totals, StoreStats::default());
}

#[tokio::test]
async fn test_context_respects_budget() {
    let dir = TempDir::new().unwrap();
    let files: Vec<(String, String)> = (0..8)
        .map(|i| {
            (
                format!("mod{}.rs", i),
                format!("// module {}\n{}", i, "fn handler() { process(request); }\n".repeat(20)),
            )
        })
        .collect();
    let refs: Vec<(&str, &str)> = files.iter().map(|(n, b)| (n.as_str(), b.as_str())).collect();
    write_files(dir.path(), &refs);

    let engine = memory_engine(test_config());
    engine.index_project(dir.path(), &NoStatus).await.unwrap();

    let budget = 1500;
    let block = engine
        .build_context("request handler", &scope_of(dir.path()), budget)
        .await
        .unwrap();
    let notice = block
        .lines()
        .find(|l| l.contains("more matches omitted"))
        .expect("budget overflow should leave a notice");
    assert!(block.chars().count() <= budget + notice.chars().count() + 1);
    assert!(block.starts_with("## Relevant code"));
}

struct AbortOnProgress(Arc<ContextEngine>);

impl StatusSink for AbortOnProgress {
    fn report(&self, event: Option<&IndexProgressEvent>) {
        if let Some(IndexProgressEvent::Indexing { .. }) = event {
            self.0.abort_indexing();
        }
    }
}

#[tokio::test]
async fn test_abort_stops_within_one_file() {
    let dir = TempDir::new().unwrap();
    for i in 0..10 {
        fs::write(dir.path().join(format!("f{:02}.rs", i)), format!("fn f{}() {{}}", i)).unwrap();
    }

    let mut config = test_config();
    config.indexing.batch_size = 2;
    let engine = Arc::new(memory_engine(config));
    let sink = AbortOnProgress(engine.clone());

    let report = engine.index_project(dir.path(), &sink).await.unwrap();
    assert_eq!(report.outcome, JobState::Aborted);
    assert_eq!(report.files_discovered, 10);
    assert_eq!(report.files_indexed, 2);
    assert_eq!(engine.job_state(&scope_of(dir.path())), JobState::Aborted);

    // A later run starts fresh and completes.
    let report = engine.index_project(dir.path(), &NoStatus).await.unwrap();
    assert_eq!(report.outcome, JobState::Completed);
    assert_eq!(report.files_indexed, 10);
}

#[tokio::test]
async fn test_status_sink_sees_progress_then_clear() {
    let dir = TempDir::new().unwrap();
    write_files(dir.path(), &[("a.rs", "fn a() {}"), ("b.rs", "fn b() {}")]);

    let seen = std::sync::Mutex::new(Vec::<Option<String>>::new());
    let sink = |msg: Option<String>| seen.lock().unwrap().push(msg);
    let engine = memory_engine(test_config());
    engine.index_project(dir.path(), &sink).await.unwrap();

    let seen = seen.into_inner().unwrap();
    assert!(seen.last().unwrap().is_none());
    let messages: Vec<String> = seen.into_iter().flatten().collect();
    assert!(messages.iter().any(|m| m.starts_with("Found 2 files")));
    assert!(messages.iter().any(|m| m == "Indexing 2 / 2 files"));
    assert!(messages.last().unwrap().starts_with("Indexing completed"));
}

/// Container CLI stand-in: `inspect` prints `running`; `exec -w DIR ID cmd…`
/// runs `cmd…` in DIR on the host.
#[cfg(unix)]
fn fake_docker(dir: &Path, running: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let script = dir.join(format!("docker-{}", running));
    let body = format!(
        "#!/bin/sh\n\
         case \"$1\" in\n\
         inspect) echo {running} ;;\n\
         exec) shift; [ \"$1\" = -w ] || exit 2; cd \"$2\" || exit 1; shift 3; exec \"$@\" ;;\n\
         *) exit 2 ;;\n\
         esac\n"
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script.to_string_lossy().into_owned()
}

#[cfg(unix)]
#[tokio::test]
async fn test_index_container_scope() {
    let bin = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    write_files(
        work.path(),
        &[
            ("app.py", "def restart_container():\n    pass\n"),
            ("README.md", "# Service\n\nRuns in Docker."),
            ("node_modules/pkg/index.js", "module.exports = 1;"),
        ],
    );

    let engine = memory_engine(test_config());
    let scope = Scope::container("c0ffee");
    let access = ContainerAccess::with_docker(
        "c0ffee",
        work.path().to_string_lossy(),
        fake_docker(bin.path(), "true"),
    );
    let report = engine.index_scope(&scope, &access, &NoStatus).await.unwrap();
    assert_eq!(report.outcome, JobState::Completed);
    assert_eq!(report.strategy, "walk");
    assert_eq!(report.files_indexed, 2);

    let hits = engine.search("restart container", &scope, Some(10)).await.unwrap();
    let mut paths: Vec<&str> = hits.iter().map(|h| h.file_path.as_str()).collect();
    paths.sort();
    assert_eq!(paths, vec!["README.md", "app.py"]);
    // The same files are not visible from the host project scope.
    assert!(engine
        .search("restart container", &scope_of(work.path()), Some(10))
        .await
        .unwrap()
        .is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_stopped_container_rejects_up_front() {
    let bin = TempDir::new().unwrap();
    let engine = memory_engine(test_config());
    let scope = Scope::container("dead");
    let access = ContainerAccess::with_docker("dead", "/", fake_docker(bin.path(), "false"));

    let seen = std::sync::Mutex::new(Vec::<Option<String>>::new());
    let sink = |msg: Option<String>| seen.lock().unwrap().push(msg);
    let err = engine.index_scope(&scope, &access, &sink).await.unwrap_err();
    assert!(matches!(err, IndexError::Unreachable(_)));
    assert_eq!(engine.job_state(&scope), JobState::Failed);

    let seen = seen.into_inner().unwrap();
    assert!(seen.iter().flatten().all(|m| !m.starts_with("Found")));
    assert!(seen.last().unwrap().is_none());
}

#[tokio::test]
async fn test_missing_directory_rejects() {
    let engine = memory_engine(test_config());
    let err = engine
        .index_project(Path::new("/definitely/not/here/devctx"), &NoStatus)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Unreachable(_)));
}

#[tokio::test]
async fn test_snapshot_survives_reopen() {
    let data = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    write_files(dir.path(), &[("a.rs", "fn a() {}"), ("b.rs", "fn b() {}")]);

    let mut config = test_config();
    config.store.path = data.path().join("index.json");

    let engine = ContextEngine::open_offline(ConfigStore::ephemeral(config.clone()))
        .await
        .unwrap();
    engine.index_project(dir.path(), &NoStatus).await.unwrap();
    let before = engine.get_stats().await.unwrap();
    assert!(before.store_bytes > 0);
    drop(engine);

    let engine = ContextEngine::open_offline(ConfigStore::ephemeral(config))
        .await
        .unwrap();
    let after = engine.get_stats().await.unwrap();
    assert_eq!(before.totals, after.totals);
    let block = engine
        .build_context("fn a", &scope_of(dir.path()), 4000)
        .await
        .unwrap();
    assert!(block.contains("a.rs"));
}

/// Delegates to memory but refuses to flush.
struct UnflushableStore(InMemoryStore);

#[async_trait]
impl Store for UnflushableStore {
    async fn delete_file(&self, scope: &Scope, file_path: &str) -> Result<usize> {
        self.0.delete_file(scope, file_path).await
    }
    async fn insert_chunks(&self, rows: Vec<(IndexedChunk, StoredEmbedding)>) -> Result<()> {
        self.0.insert_chunks(rows).await
    }
    async fn retain_files(&self, scope: &Scope, keep: &HashSet<String>) -> Result<usize> {
        self.0.retain_files(scope, keep).await
    }
    async fn replace_file_tree(&self, scope: &Scope, entries: Vec<FileTreeEntry>) -> Result<()> {
        self.0.replace_file_tree(scope, entries).await
    }
    async fn upsert_repo_metadata(&self, meta: RepoMetadata) -> Result<()> {
        self.0.upsert_repo_metadata(meta).await
    }
    async fn similarity_search(
        &self,
        scope: &Scope,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<SearchHit>> {
        self.0.similarity_search(scope, query, top_k, min_similarity).await
    }
    async fn file_tree(&self, scope: &Scope) -> Result<Vec<FileTreeEntry>> {
        self.0.file_tree(scope).await
    }
    async fn repo_metadata(&self, scope: &Scope) -> Result<Option<RepoMetadata>> {
        self.0.repo_metadata(scope).await
    }
    async fn stats(&self, scope: Option<&Scope>) -> Result<StoreStats> {
        self.0.stats(scope).await
    }
    async fn scopes(&self) -> Result<Vec<Scope>> {
        self.0.scopes().await
    }
    async fn clear_scope(&self, scope: &Scope) -> Result<()> {
        self.0.clear_scope(scope).await
    }
    async fn clear_all(&self) -> Result<()> {
        self.0.clear_all().await
    }
    async fn flush(&self) -> Result<()> {
        anyhow::bail!("disk full")
    }
}

#[tokio::test]
async fn test_store_failure_fails_job() {
    let dir = TempDir::new().unwrap();
    write_files(dir.path(), &[("a.rs", "fn a() {}")]);

    let engine = ContextEngine::with_parts(
        ConfigStore::ephemeral(test_config()),
        Arc::new(UnflushableStore(InMemoryStore::new())),
        EmbeddingPipeline::hash_only(64, EmbeddingCache::new(10, 64)),
    );
    let err = engine.index_project(dir.path(), &NoStatus).await.unwrap_err();
    assert!(matches!(err, IndexError::Store(_)));
    assert!(err.to_string().contains("disk full"));
    assert_eq!(engine.job_state(&scope_of(dir.path())), JobState::Failed);
}
