//! Indexing controller: discovery, then read, chunk, embed and store each
//! file of a scope.
//!
//! # Job lifecycle
//!
//! ```text
//! Idle ──index_scope──▶ Running ──▶ Completed
//!                          │   └──▶ Aborted   (cancel token seen between files)
//!                          └──────▶ Failed    (store error, unreachable scope)
//! ```
//!
//! A scope returns to `Idle` semantics after any terminal state: the next
//! `index_scope` call simply starts a new run.
//!
//! Per-file problems (unreadable, binary, oversized, not UTF-8, nothing
//! embeddable) are logged and the file is skipped. Only store failures end
//! the job early. Cancellation is checked once at the top of each file, so
//! an abort takes effect within one file.
//!
//! After every `batch_size` files the controller reports progress and
//! sleeps `yield_ms` so inference does not starve the rest of the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use devctx_core::chunk::ChunkParams;
use devctx_core::embedding::EmbeddingPipeline;
use devctx_core::index::{self, FileIndexSummary, IndexFileError};
use devctx_core::models::Scope;
use devctx_core::store::Store;

use crate::access::FileAccess;
use crate::config::Config;
use crate::discovery::{DiscoveredFile, Discovery};
use crate::status::{IndexProgressEvent, StatusSink};
use crate::vcs::GitProbe;

/// Bytes inspected for NUL when deciding a file is binary.
const BINARY_SNIFF_BYTES: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Aborted => "aborted",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why one file was skipped. Logged, never returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum FileSkip {
    #[error("read failed: {0}")]
    Read(String),
    #[error("binary content")]
    Binary,
    #[error("{size} bytes exceeds the {limit}-byte limit")]
    Oversized { size: u64, limit: u64 },
    #[error("not valid UTF-8")]
    NotUtf8,
    #[error("no chunk could be embedded")]
    Embedding,
}

/// Why a job ended in `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("scope is unreachable: {0}")]
    Unreachable(String),
    #[error("index store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

enum FileError {
    Skip(FileSkip),
    Store(anyhow::Error),
}

/// Indexing knobs, taken from [`Config`] when the job starts.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub chunk: ChunkParams,
    pub batch_size: usize,
    pub yield_ms: u64,
    pub max_file_bytes: u64,
    pub slow_file_ms: u64,
    pub exclude_globs: Vec<String>,
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk: config.chunking.params(),
            batch_size: config.indexing.batch_size.max(1),
            yield_ms: config.indexing.yield_ms,
            max_file_bytes: config.indexing.max_file_bytes,
            slow_file_ms: config.indexing.slow_file_ms,
            exclude_globs: config.indexing.exclude_globs.clone(),
        }
    }
}

/// Result of a job that reached `Completed` or `Aborted`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub outcome: JobState,
    pub files_discovered: usize,
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub chunks_written: usize,
    /// Chunks of files that no longer exist, dropped after a completed run.
    pub chunks_removed: usize,
    pub tree_entries: usize,
    pub strategy: String,
    pub elapsed_ms: u64,
}

struct Job {
    id: u64,
    token: CancellationToken,
}

/// Runs indexing jobs against one store and one embedding pipeline.
///
/// Jobs for different scopes may overlap; nothing serializes them beyond
/// the store's own locking. [`abort_all`](Self::abort_all) cancels every
/// running job.
pub struct IndexingController {
    store: Arc<dyn Store>,
    pipeline: Arc<EmbeddingPipeline>,
    jobs: Mutex<HashMap<Scope, Job>>,
    states: Mutex<HashMap<Scope, JobState>>,
    next_id: AtomicU64,
}

impl IndexingController {
    pub fn new(store: Arc<dyn Store>, pipeline: Arc<EmbeddingPipeline>) -> Self {
        Self {
            store,
            pipeline,
            jobs: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Last known state for `scope`; `Idle` if it never ran.
    pub fn state(&self, scope: &Scope) -> JobState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(scope)
            .copied()
            .unwrap_or(JobState::Idle)
    }

    /// Signal every running job to stop before its next file.
    pub fn abort_all(&self) {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for (scope, job) in jobs.iter() {
            tracing::info!(%scope, "abort requested");
            job.token.cancel();
        }
    }

    fn set_state(&self, scope: &Scope, state: JobState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scope.clone(), state);
    }

    fn register(&self, scope: &Scope) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(scope) {
            tracing::warn!(%scope, "scope is already being indexed; running concurrently");
        }
        jobs.insert(
            scope.clone(),
            Job {
                id,
                token: token.clone(),
            },
        );
        (id, token)
    }

    fn unregister(&self, scope: &Scope, id: u64) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.get(scope).is_some_and(|j| j.id == id) {
            jobs.remove(scope);
        }
    }

    /// Index every discoverable file of `scope` through `access`.
    ///
    /// Returns the report for `Completed` and `Aborted` runs. `status`
    /// receives milestones and, last, `None`.
    pub async fn index_scope(
        &self,
        scope: &Scope,
        access: &dyn FileAccess,
        settings: &IndexSettings,
        status: &dyn StatusSink,
    ) -> Result<IndexReport, IndexError> {
        let (id, token) = self.register(scope);
        self.set_state(scope, JobState::Running);
        let started = Instant::now();

        let result = self.run(scope, access, settings, status, &token, started).await;

        let (state, files_indexed) = match &result {
            Ok(report) => (report.outcome, report.files_indexed as u64),
            Err(e) => {
                tracing::error!(%scope, error = %e, "indexing failed");
                (JobState::Failed, 0)
            }
        };
        self.set_state(scope, state);
        self.unregister(scope, id);
        status.report(Some(&IndexProgressEvent::Finished {
            outcome: state,
            files_indexed,
        }));
        status.report(None);
        result
    }

    async fn run(
        &self,
        scope: &Scope,
        access: &dyn FileAccess,
        settings: &IndexSettings,
        status: &dyn StatusSink,
        token: &CancellationToken,
        started: Instant,
    ) -> Result<IndexReport, IndexError> {
        if !access.is_alive().await.unwrap_or(false) {
            return Err(IndexError::Unreachable(format!(
                "{} ({})",
                scope,
                access.root()
            )));
        }

        status.report(Some(&IndexProgressEvent::Discovering {
            root: access.root().to_string(),
        }));
        let discovery = Discovery::new(settings.max_file_bytes, &settings.exclude_globs);
        let discovered = discovery.discover(access).await;
        let total = discovered.files.len();
        status.report(Some(&IndexProgressEvent::Discovered {
            total: total as u64,
            strategy: discovered.strategy.to_string(),
        }));

        let paths: Vec<String> = discovered.files.iter().map(|f| f.path.clone()).collect();
        // An empty listing may be a transient access failure; keep the old tree.
        let tree_entries = if paths.is_empty() {
            tracing::warn!(%scope, "nothing discovered; keeping the existing file tree");
            0
        } else {
            index::build_file_tree(self.store.as_ref(), scope, &paths, access.root()).await?
        };

        let info = GitProbe::new(access).repo_info().await;
        if !info.is_empty() {
            index::upsert_repo_metadata(self.store.as_ref(), scope, info).await?;
        }

        let fallback_before = self.pipeline.fallback_hits();
        let mut fallback_reported = false;
        let mut outcome = JobState::Completed;
        let mut files_indexed = 0usize;
        let mut files_skipped = 0usize;
        let mut chunks_written = 0usize;

        for (i, file) in discovered.files.iter().enumerate() {
            if token.is_cancelled() {
                tracing::info!(%scope, processed = i, total, "indexing aborted");
                outcome = JobState::Aborted;
                break;
            }

            let file_started = Instant::now();
            match self.index_one(scope, access, file, settings).await {
                Ok(summary) => {
                    files_indexed += 1;
                    chunks_written += summary.chunks_written;
                    tracing::debug!(%scope, file = %file.path, chunks = summary.chunks_written, "file indexed");
                    if summary.truncated {
                        tracing::warn!(%scope, file = %file.path, "file truncated at chunk ceiling");
                    }
                }
                Err(FileError::Skip(reason)) => {
                    files_skipped += 1;
                    tracing::warn!(%scope, file = %file.path, reason = %reason, "file skipped");
                }
                Err(FileError::Store(e)) => return Err(IndexError::Store(e)),
            }

            let elapsed_ms = file_started.elapsed().as_millis() as u64;
            if elapsed_ms > settings.slow_file_ms {
                status.report(Some(&IndexProgressEvent::SlowFile {
                    file: file.path.clone(),
                    elapsed_ms,
                }));
            }
            if !fallback_reported && self.pipeline.fallback_hits() > fallback_before {
                fallback_reported = true;
                status.report(Some(&IndexProgressEvent::FallbackActive));
            }

            let n = i + 1;
            if n % settings.batch_size == 0 && n < total {
                status.report(Some(&IndexProgressEvent::Indexing {
                    n: n as u64,
                    total: total as u64,
                }));
                if settings.yield_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(settings.yield_ms)).await;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        }

        let mut chunks_removed = 0usize;
        if outcome == JobState::Completed && total > 0 {
            status.report(Some(&IndexProgressEvent::Indexing {
                n: total as u64,
                total: total as u64,
            }));
            chunks_removed =
                index::remove_missing_files(self.store.as_ref(), scope, &paths).await?;
        }

        let report = IndexReport {
            outcome,
            files_discovered: total,
            files_indexed,
            files_skipped,
            chunks_written,
            chunks_removed,
            tree_entries,
            strategy: discovered.strategy.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            %scope,
            outcome = %report.outcome,
            files = report.files_indexed,
            skipped = report.files_skipped,
            chunks = report.chunks_written,
            removed = report.chunks_removed,
            elapsed_ms = report.elapsed_ms,
            "indexing finished"
        );
        Ok(report)
    }

    async fn index_one(
        &self,
        scope: &Scope,
        access: &dyn FileAccess,
        file: &DiscoveredFile,
        settings: &IndexSettings,
    ) -> Result<FileIndexSummary, FileError> {
        let limit = settings.max_file_bytes;
        if file.size > limit {
            return Err(FileError::Skip(FileSkip::Oversized {
                size: file.size,
                limit,
            }));
        }

        let bytes = access
            .read(&file.path)
            .await
            .map_err(|e| FileError::Skip(FileSkip::Read(format!("{:#}", e))))?;
        if bytes.len() as u64 > limit {
            return Err(FileError::Skip(FileSkip::Oversized {
                size: bytes.len() as u64,
                limit,
            }));
        }
        if looks_binary(&bytes) {
            return Err(FileError::Skip(FileSkip::Binary));
        }
        let text = String::from_utf8(bytes).map_err(|_| FileError::Skip(FileSkip::NotUtf8))?;

        index::index_file(
            self.store.as_ref(),
            &self.pipeline,
            &settings.chunk,
            scope,
            &file.path,
            &text,
            file.modified,
        )
        .await
        .map_err(|e| match e {
            IndexFileError::EmbeddingExhausted => FileError::Skip(FileSkip::Embedding),
            IndexFileError::Store(e) => FileError::Store(e),
        })
    }
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(BINARY_SNIFF_BYTES).any(|&b| b == 0)
}
