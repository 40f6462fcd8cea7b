//! Indexing status reporting.
//!
//! The controller reports milestones as [`IndexProgressEvent`]s to a
//! [`StatusSink`], and calls the sink with `None` exactly once when the job
//! reaches a terminal state, so a UI can clear its status line.
//!
//! Any `Fn(Option<String>)` closure is a sink and receives the rendered,
//! human-readable message. The CLI sinks write to **stderr** so stdout
//! stays parseable for scripts.

use std::fmt;
use std::io::Write;

use crate::indexer::JobState;

#[derive(Clone, Debug, PartialEq)]
pub enum IndexProgressEvent {
    /// Listing files; total not known yet.
    Discovering { root: String },
    Discovered { total: u64, strategy: String },
    /// `n` files processed out of `total`.
    Indexing { n: u64, total: u64 },
    SlowFile { file: String, elapsed_ms: u64 },
    /// The primary model failed at least once this run; vectors are coming
    /// from the hash fallback.
    FallbackActive,
    Finished { outcome: JobState, files_indexed: u64 },
}

impl fmt::Display for IndexProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexProgressEvent::Discovering { root } => write!(f, "Discovering files in {}...", root),
            IndexProgressEvent::Discovered { total, strategy } => {
                write!(f, "Found {} files to index (via {})", format_number(*total), strategy)
            }
            IndexProgressEvent::Indexing { n, total } => write!(
                f,
                "Indexing {} / {} files",
                format_number(*n),
                format_number(*total)
            ),
            IndexProgressEvent::SlowFile { file, elapsed_ms } => write!(
                f,
                "Embedding is slow: {} took {:.1}s",
                file,
                *elapsed_ms as f64 / 1000.0
            ),
            IndexProgressEvent::FallbackActive => {
                write!(f, "Embedding model unavailable, using fallback embeddings")
            }
            IndexProgressEvent::Finished {
                outcome,
                files_indexed,
            } => write!(f, "Indexing {}: {} files indexed", outcome, format_number(*files_indexed)),
        }
    }
}

/// Receives status updates from an indexing job.
pub trait StatusSink: Send + Sync {
    /// `Some(event)` for a milestone; `None` once the job is over.
    fn report(&self, event: Option<&IndexProgressEvent>);
}

impl<F> StatusSink for F
where
    F: Fn(Option<String>) + Send + Sync,
{
    fn report(&self, event: Option<&IndexProgressEvent>) {
        self(event.map(|e| e.to_string()))
    }
}

/// Human-friendly status on stderr.
pub struct StderrStatus;

impl StatusSink for StderrStatus {
    fn report(&self, event: Option<&IndexProgressEvent>) {
        if let Some(event) = event {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", event);
            let _ = err.flush();
        }
    }
}

/// Machine-readable status: one JSON object per line on stderr.
pub struct JsonStatus;

impl StatusSink for JsonStatus {
    fn report(&self, event: Option<&IndexProgressEvent>) {
        let obj = match event {
            None => serde_json::json!({ "event": "clear" }),
            Some(IndexProgressEvent::Discovering { root }) => serde_json::json!({
                "event": "progress", "phase": "discovering", "root": root
            }),
            Some(IndexProgressEvent::Discovered { total, strategy }) => serde_json::json!({
                "event": "progress", "phase": "discovered", "total": total, "strategy": strategy
            }),
            Some(IndexProgressEvent::Indexing { n, total }) => serde_json::json!({
                "event": "progress", "phase": "indexing", "n": n, "total": total
            }),
            Some(IndexProgressEvent::SlowFile { file, elapsed_ms }) => serde_json::json!({
                "event": "warning", "kind": "slow_file", "file": file, "elapsed_ms": elapsed_ms
            }),
            Some(IndexProgressEvent::FallbackActive) => serde_json::json!({
                "event": "warning", "kind": "fallback_active"
            }),
            Some(IndexProgressEvent::Finished {
                outcome,
                files_indexed,
            }) => serde_json::json!({
                "event": "finished", "outcome": outcome.to_string(), "files_indexed": files_indexed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// Discards every update.
pub struct NoStatus;

impl StatusSink for NoStatus {
    fn report(&self, _event: Option<&IndexProgressEvent>) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Status mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusMode {
    Off,
    Human,
    Json,
}

impl StatusMode {
    /// Human status when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            StatusMode::Human
        } else {
            StatusMode::Off
        }
    }

    pub fn sink(&self) -> Box<dyn StatusSink> {
        match self {
            StatusMode::Off => Box::new(NoStatus),
            StatusMode::Human => Box::new(StderrStatus),
            StatusMode::Json => Box::new(JsonStatus),
        }
    }
}
