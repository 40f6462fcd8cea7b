//! Core data models shared by the indexing and retrieval paths.
//!
//! Every stored row is tagged with a [`Scope`]. Retrieval filters on the
//! scope before anything else, so rows from different scopes are never
//! compared.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Indexing namespace: a local project directory or a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    /// A project rooted at a local path.
    Project(String),
    /// A container, identified by its container ID.
    Container(String),
}

impl Scope {
    /// Build a project scope, normalizing trailing separators so that
    /// `/src/app` and `/src/app/` name the same scope.
    pub fn project(path: impl AsRef<str>) -> Self {
        let path = path.as_ref();
        let trimmed = path.trim_end_matches(['/', '\\']);
        if trimmed.is_empty() {
            Scope::Project(path.to_string())
        } else {
            Scope::Project(trimmed.to_string())
        }
    }

    pub fn container(id: impl Into<String>) -> Self {
        Scope::Container(id.into())
    }

    /// Stable string key, e.g. `project:/home/me/app` or `container:3f2a…`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Project(path) => write!(f, "project:{}", path),
            Scope::Container(id) => write!(f, "container:{}", id),
        }
    }
}

/// A chunk of one file's content, scope-tagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub id: String,
    pub scope: Scope,
    /// Path relative to the scope root, `/`-separated.
    pub file_path: String,
    pub content: String,
    pub chunk_index: usize,
    /// Char offset of the first character in the source file.
    pub start: usize,
    /// Char offset one past the last character.
    pub end: usize,
    /// SHA-256 of `content`.
    pub hash: String,
    /// Unix seconds.
    pub last_modified: i64,
    pub embedding_dimension: usize,
}

/// Vector for exactly one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEmbedding {
    pub chunk_id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTreeEntry {
    pub scope: Scope,
    pub path: String,
    pub is_directory: bool,
    /// Empty string for top-level entries.
    pub parent_path: String,
    pub last_indexed: i64,
}

/// VCS facts gathered at index time. Every field is optional because a
/// scope may not be a repository, or may have no remote or commits yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub remote_url: Option<String>,
    pub branch: Option<String>,
    pub last_commit: Option<String>,
    pub last_commit_message: Option<String>,
}

impl RepoInfo {
    pub fn is_empty(&self) -> bool {
        self.remote_url.is_none()
            && self.branch.is_none()
            && self.last_commit.is_none()
            && self.last_commit_message.is_none()
    }
}

/// One row per scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMetadata {
    pub scope: Scope,
    #[serde(flatten)]
    pub info: RepoInfo,
    pub last_indexed: i64,
}

/// A ranked chunk returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub file_path: String,
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
    pub content: String,
    pub similarity: f32,
}

/// Row counts, either store-wide or for one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_chunks: usize,
    pub total_embeddings: usize,
    pub total_tree_entries: usize,
    pub total_repos: usize,
}
