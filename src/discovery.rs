//! File discovery: which files in a scope are worth indexing.
//!
//! Candidate paths come from an ordered list of [`DiscoveryStrategy`]s; the
//! first one that succeeds with a non-empty list wins. By default that is
//! git (tracked plus unignored files) and then a recursive walk that prunes
//! well-known dependency, build and metadata directories at any depth.
//!
//! Candidates are then filtered by extension, by the user's exclude globs,
//! and by size, in that order. Size comes from a stat, never a read.

use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

use crate::access::FileAccess;
use crate::vcs::GitProbe;

/// Directory names never descended into by the walk.
pub const PRUNE_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "bower_components",
    "vendor",
    "target",
    "build",
    "dist",
    "out",
    ".next",
    ".nuxt",
    ".cache",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    ".gradle",
    ".idea",
    ".vscode",
    "coverage",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "rs", "toml", "md", "markdown", "txt", "rst", "adoc", "py", "pyi", "js", "mjs", "cjs", "jsx",
    "ts", "tsx", "vue", "svelte", "go", "java", "kt", "kts", "scala", "c", "h", "cc", "cpp",
    "cxx", "hpp", "hh", "cs", "fs", "swift", "m", "mm", "rb", "php", "pl", "lua", "r", "jl",
    "ex", "exs", "erl", "hrl", "hs", "ml", "mli", "clj", "dart", "zig", "nim", "sh", "bash",
    "zsh", "fish", "ps1", "bat", "sql", "graphql", "gql", "proto", "json", "jsonc", "yaml",
    "yml", "xml", "ini", "cfg", "conf", "env", "properties", "gradle", "cmake", "mk", "html",
    "htm", "css", "scss", "sass", "less", "tf", "hcl", "nix", "dockerfile", "csv", "tsv",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "svg", "pdf", "zip", "gz", "tgz", "bz2",
    "xz", "7z", "rar", "tar", "jar", "war", "class", "exe", "dll", "so", "dylib", "a", "o",
    "obj", "bin", "wasm", "pyc", "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4", "mov",
    "avi", "wav", "flac", "db", "sqlite", "lock", "map",
];

const KNOWN_NAMES: &[&str] = &[
    "readme",
    "license",
    "licence",
    "copying",
    "notice",
    "authors",
    "contributors",
    "changelog",
    "makefile",
    "gnumakefile",
    "dockerfile",
    "containerfile",
    "justfile",
    "procfile",
    "gemfile",
    "rakefile",
    "vagrantfile",
    "jenkinsfile",
    "cmakelists.txt",
    ".gitignore",
    ".dockerignore",
    ".editorconfig",
    ".env.example",
];

const DENY_NAMES: &[&str] = &["package-lock.json", "yarn.lock", "pnpm-lock.yaml", "cargo.lock"];

/// Whether a path looks like a text source file worth indexing.
pub fn is_indexable(path: &str) -> bool {
    let name = match Path::new(path).file_name() {
        Some(n) => n.to_string_lossy().to_lowercase(),
        None => return false,
    };
    if DENY_NAMES.contains(&name.as_str()) {
        return false;
    }
    if KNOWN_NAMES.contains(&name.as_str()) {
        return true;
    }
    if name.ends_with(".min.js") {
        return false;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            if BINARY_EXTENSIONS.contains(&ext) {
                false
            } else {
                TEXT_EXTENSIONS.contains(&ext)
            }
        }
        // Extensionless, or a dotfile such as `.bashrc`.
        _ => {
            let base = name.split('.').find(|s| !s.is_empty()).unwrap_or("");
            KNOWN_NAMES.contains(&base)
        }
    }
}

/// One way of listing candidate paths.
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn candidates(&self, access: &dyn FileAccess) -> Result<Vec<String>>;
}

/// Files git knows about (ignored paths excluded).
pub struct GitTracked;

#[async_trait]
impl DiscoveryStrategy for GitTracked {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn candidates(&self, access: &dyn FileAccess) -> Result<Vec<String>> {
        let probe = GitProbe::new(access);
        if !probe.is_repository().await {
            anyhow::bail!("not a git repository");
        }
        probe.list_tracked_files().await
    }
}

/// Recursive walk with [`PRUNE_DIRS`] pruned.
pub struct FsWalk;

#[async_trait]
impl DiscoveryStrategy for FsWalk {
    fn name(&self) -> &'static str {
        "walk"
    }

    async fn candidates(&self, access: &dyn FileAccess) -> Result<Vec<String>> {
        access.walk(PRUNE_DIRS).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: String,
    pub size: u64,
    pub modified: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Discovered {
    /// Sorted by path.
    pub files: Vec<DiscoveredFile>,
    /// Name of the strategy that produced the candidates.
    pub strategy: &'static str,
    pub oversized: usize,
}

pub struct Discovery {
    strategies: Vec<Box<dyn DiscoveryStrategy>>,
    max_file_bytes: u64,
    excludes: GlobSet,
}

impl Discovery {
    /// Git first, walk second.
    pub fn new(max_file_bytes: u64, exclude_globs: &[String]) -> Self {
        Self::with_strategies(
            vec![Box::new(GitTracked), Box::new(FsWalk)],
            max_file_bytes,
            exclude_globs,
        )
    }

    /// Invalid exclude globs are logged and ignored.
    pub fn with_strategies(
        strategies: Vec<Box<dyn DiscoveryStrategy>>,
        max_file_bytes: u64,
        exclude_globs: &[String],
    ) -> Self {
        Self {
            strategies,
            max_file_bytes,
            excludes: build_globset(exclude_globs),
        }
    }

    /// List indexable files. Never fails: a strategy error moves on to the
    /// next strategy, and if all fail the result is empty.
    pub async fn discover(&self, access: &dyn FileAccess) -> Discovered {
        let mut chosen: Option<(&'static str, Vec<String>)> = None;
        for strategy in &self.strategies {
            match strategy.candidates(access).await {
                Ok(paths) if !paths.is_empty() => {
                    chosen = Some((strategy.name(), paths));
                    break;
                }
                Ok(_) => {
                    tracing::debug!(strategy = strategy.name(), root = access.root(), "no candidates")
                }
                Err(e) => {
                    tracing::debug!(strategy = strategy.name(), root = access.root(), error = %e, "discovery strategy failed")
                }
            }
        }

        let Some((strategy, paths)) = chosen else {
            tracing::warn!(root = access.root(), "no files discovered");
            return Discovered::default();
        };

        let mut candidates: Vec<String> = paths
            .into_iter()
            .filter(|p| is_indexable(p))
            .filter(|p| !self.excludes.is_match(p))
            .collect();
        candidates.sort();
        candidates.dedup();

        let mut oversized = 0usize;
        let mut files: Vec<DiscoveredFile> = access
            .stat_many(&candidates)
            .await
            .into_iter()
            .filter(|(path, meta)| {
                if meta.size > self.max_file_bytes {
                    tracing::debug!(file = %path, size = meta.size, "oversized, skipped");
                    oversized += 1;
                    false
                } else {
                    true
                }
            })
            .map(|(path, meta)| DiscoveredFile {
                path,
                size: meta.size,
                modified: meta.modified,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::info!(root = access.root(), strategy, files = files.len(), oversized, "discovery finished");
        Discovered {
            files,
            strategy,
            oversized,
        }
    }
}

fn build_globset(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => tracing::warn!(pattern = %pattern, error = %e, "ignoring invalid exclude glob"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "exclude globs unusable, ignoring all");
        GlobSet::empty()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::LocalAccess;

    struct Failing;

    #[async_trait]
    impl DiscoveryStrategy for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn candidates(&self, _access: &dyn FileAccess) -> Result<Vec<String>> {
            anyhow::bail!("tool missing")
        }
    }

    #[test]
    fn test_is_indexable() {
        assert!(is_indexable("src/main.rs"));
        assert!(is_indexable("README"));
        assert!(is_indexable("docs/LICENSE"));
        assert!(is_indexable("Makefile"));
        assert!(is_indexable("README.md"));
        assert!(is_indexable(".gitignore"));
        assert!(!is_indexable("logo.png"));
        assert!(!is_indexable("bin/tool"));
        assert!(!is_indexable("Cargo.lock"));
        assert!(!is_indexable("app.min.js"));
        assert!(!is_indexable("data.weird"));
    }

    #[tokio::test]
    async fn test_walk_fallback_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/x")).unwrap();
        std::fs::write(root.join("src/b.rs"), "b").unwrap();
        std::fs::write(root.join("src/a.rs"), "a").unwrap();
        std::fs::write(root.join("image.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(root.join("node_modules/x/index.js"), "x").unwrap();
        std::fs::write(root.join("big.txt"), "x".repeat(2048)).unwrap();
        std::fs::write(root.join("skip.md"), "s").unwrap();

        let discovery = Discovery::with_strategies(
            vec![Box::new(Failing), Box::new(FsWalk)],
            1024,
            &["skip.*".to_string()],
        );
        let access = LocalAccess::new(root);
        let found = discovery.discover(&access).await;

        assert_eq!(found.strategy, "walk");
        let paths: Vec<_> = found.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/a.rs", "src/b.rs"]);
        assert_eq!(found.oversized, 1);
    }

    #[tokio::test]
    async fn test_all_strategies_fail_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Discovery::with_strategies(vec![Box::new(Failing)], 1024, &[]);
        let found = discovery.discover(&LocalAccess::new(dir.path())).await;
        assert!(found.files.is_empty());
    }

    #[tokio::test]
    async fn test_bad_exclude_glob_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "a").unwrap();
        let discovery = Discovery::with_strategies(
            vec![Box::new(FsWalk)],
            1024,
            &["a[".to_string(), "*.md".to_string()],
        );
        let found = discovery.discover(&LocalAccess::new(dir.path())).await;
        assert_eq!(found.files.len(), 1);
    }
}
