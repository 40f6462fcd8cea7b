//! File access for a scope: the local filesystem, or a container reached
//! through `docker exec`.
//!
//! Everything the indexer needs from the outside world goes through
//! [`FileAccess`], so discovery and indexing are written once for both
//! kinds of scope. Paths passed in and returned are relative to the
//! access root and `/`-separated.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use std::time::{Duration, UNIX_EPOCH};
use tokio::process::Command;
use walkdir::WalkDir;

/// Upper bound on any single external command (git, docker).
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Paths per `stat` invocation inside a container.
const STAT_BATCH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    /// Unix seconds.
    pub modified: i64,
}

#[async_trait]
pub trait FileAccess: Send + Sync {
    /// Human-readable root, used in logs and as the tree root.
    fn root(&self) -> &str;

    /// Whether the target can be reached at all.
    async fn is_alive(&self) -> Result<bool>;

    async fn read(&self, rel: &str) -> Result<Vec<u8>>;

    async fn stat(&self, rel: &str) -> Result<FileMeta>;

    /// Stat many paths. Paths that cannot be stat'ed are left out.
    async fn stat_many(&self, rels: &[String]) -> Vec<(String, FileMeta)> {
        let mut out = Vec::with_capacity(rels.len());
        for rel in rels {
            match self.stat(rel).await {
                Ok(meta) => out.push((rel.clone(), meta)),
                Err(e) => tracing::debug!(file = %rel, error = %e, "stat failed"),
            }
        }
        out
    }

    /// Every regular file under the root, skipping any directory whose name
    /// is in `prune` at any depth.
    async fn walk(&self, prune: &[&str]) -> Result<Vec<String>>;

    /// Run `git <args>` in the root and return stdout. Non-zero exit,
    /// missing tool or timeout are errors.
    async fn git(&self, args: &[&str]) -> Result<String>;
}

async fn run(mut cmd: Command, what: &str) -> Result<Output> {
    cmd.kill_on_drop(true);
    let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
        .await
        .with_context(|| format!("{} timed out after {:?}", what, COMMAND_TIMEOUT))?
        .with_context(|| format!("Failed to run {}", what))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} failed ({}): {}", what, output.status, stderr.trim());
    }
    Ok(output)
}

fn normalize_rel(rel: &str) -> String {
    rel.replace('\\', "/")
        .trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}

/// Files under a local directory.
pub struct LocalAccess {
    root: PathBuf,
    root_str: String,
}

impl LocalAccess {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root_str = root.to_string_lossy().into_owned();
        Self { root, root_str }
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

#[async_trait]
impl FileAccess for LocalAccess {
    fn root(&self) -> &str {
        &self.root_str
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn read(&self, rel: &str) -> Result<Vec<u8>> {
        let path = self.resolve(rel);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn stat(&self, rel: &str) -> Result<FileMeta> {
        let path = self.resolve(rel);
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let modified = meta
            .modified()
            .unwrap_or(UNIX_EPOCH)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        Ok(FileMeta {
            size: meta.len(),
            modified,
        })
    }

    async fn walk(&self, prune: &[&str]) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prune: Vec<String> = prune.iter().map(|s| s.to_string()).collect();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut files = Vec::new();
            let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
                e.depth() == 0
                    || !e.file_type().is_dir()
                    || !prune.iter().any(|p| e.file_name() == p.as_str())
            });
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!(error = %e, "walk entry skipped");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                files.push(normalize_rel(&rel.to_string_lossy()));
            }
            Ok(files)
        })
        .await
        .context("walk task panicked")?
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.root).args(args);
        let output = run(cmd, &format!("git {}", args.join(" "))).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Files inside a running container, reached with `docker exec`.
pub struct ContainerAccess {
    container_id: String,
    workdir: String,
    docker: String,
}

impl ContainerAccess {
    /// Use the `docker` CLI, or the program named by `$DEVCTX_DOCKER`.
    pub fn new(container_id: impl Into<String>, workdir: impl Into<String>) -> Self {
        let docker = std::env::var("DEVCTX_DOCKER").unwrap_or_else(|_| "docker".to_string());
        Self::with_docker(container_id, workdir, docker)
    }

    /// Use `docker` as the container CLI. It must accept `inspect` and
    /// `exec -w <dir> <id> <cmd…>` the way docker and podman do.
    pub fn with_docker(
        container_id: impl Into<String>,
        workdir: impl Into<String>,
        docker: impl Into<String>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            workdir: workdir.into(),
            docker: docker.into(),
        }
    }

    async fn exec(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.docker);
        cmd.args(["exec", "-w", self.workdir.as_str(), self.container_id.as_str()])
            .args(args);
        let what = format!("docker exec {} {}", self.container_id, args.first().unwrap_or(&""));
        Ok(run(cmd, &what).await?.stdout)
    }
}

/// Parse `stat -c '%s %Y %n'` output lines.
fn parse_stat_lines(stdout: &str) -> Vec<(String, FileMeta)> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ' ');
            let size = parts.next()?.parse().ok()?;
            let modified = parts.next()?.parse().ok()?;
            let name = parts.next()?;
            Some((normalize_rel(name), FileMeta { size, modified }))
        })
        .collect()
}

#[async_trait]
impl FileAccess for ContainerAccess {
    fn root(&self) -> &str {
        &self.workdir
    }

    async fn is_alive(&self) -> Result<bool> {
        let mut cmd = Command::new(&self.docker);
        cmd.args(["inspect", "-f", "{{.State.Running}}", self.container_id.as_str()]);
        match run(cmd, "docker inspect").await {
            Ok(out) => Ok(String::from_utf8_lossy(&out.stdout).trim() == "true"),
            Err(e) => {
                tracing::debug!(container = %self.container_id, error = %e, "liveness check failed");
                Ok(false)
            }
        }
    }

    async fn read(&self, rel: &str) -> Result<Vec<u8>> {
        self.exec(&["cat", "--", rel]).await
    }

    async fn stat(&self, rel: &str) -> Result<FileMeta> {
        let out = self.exec(&["stat", "-c", "%s %Y %n", "--", rel]).await?;
        parse_stat_lines(&String::from_utf8_lossy(&out))
            .into_iter()
            .next()
            .map(|(_, meta)| meta)
            .ok_or_else(|| anyhow::anyhow!("Unexpected stat output for {}", rel))
    }

    async fn stat_many(&self, rels: &[String]) -> Vec<(String, FileMeta)> {
        let mut out = Vec::with_capacity(rels.len());
        for batch in rels.chunks(STAT_BATCH) {
            let mut args: Vec<&str> = vec!["stat", "-c", "%s %Y %n", "--"];
            args.extend(batch.iter().map(String::as_str));
            match self.exec(&args).await {
                Ok(stdout) => out.extend(parse_stat_lines(&String::from_utf8_lossy(&stdout))),
                Err(e) => {
                    // One unreadable path fails the whole batch; fall back to one by one.
                    tracing::debug!(error = %e, "batched stat failed");
                    for rel in batch {
                        if let Ok(meta) = self.stat(rel).await {
                            out.push((rel.clone(), meta));
                        }
                    }
                }
            }
        }
        out
    }

    async fn walk(&self, prune: &[&str]) -> Result<Vec<String>> {
        let mut args: Vec<&str> = vec!["find", "."];
        if !prune.is_empty() {
            args.push("(");
            for (i, name) in prune.iter().enumerate() {
                if i > 0 {
                    args.push("-o");
                }
                args.extend(["-name", *name]);
            }
            args.extend([")", "-type", "d", "-prune", "-o"]);
        }
        args.extend(["-type", "f", "-print"]);
        let out = self.exec(&args).await?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .map(normalize_rel)
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["git"];
        full.extend_from_slice(args);
        let out = self.exec(&full).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
