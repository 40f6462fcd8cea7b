//! Git probing through a [`FileAccess`], so the same code serves local
//! directories and containers.
//!
//! Every method degrades instead of failing: a missing `git`, a timeout or
//! a non-repository simply yields `false`, an error the caller treats as
//! "not available", or an empty [`RepoInfo`].

use anyhow::Result;

use devctx_core::models::RepoInfo;

use crate::access::FileAccess;

pub struct GitProbe<'a> {
    access: &'a dyn FileAccess,
}

impl<'a> GitProbe<'a> {
    pub fn new(access: &'a dyn FileAccess) -> Self {
        Self { access }
    }

    pub async fn is_repository(&self) -> bool {
        match self.access.git(&["rev-parse", "--is-inside-work-tree"]).await {
            Ok(out) => out.trim() == "true",
            Err(e) => {
                tracing::debug!(root = self.access.root(), error = %e, "git probe failed");
                false
            }
        }
    }

    /// Tracked files plus untracked files git does not ignore, relative to
    /// the access root.
    pub async fn list_tracked_files(&self) -> Result<Vec<String>> {
        let out = self
            .access
            .git(&["ls-files", "-z", "--cached", "--others", "--exclude-standard"])
            .await?;
        let mut files: Vec<String> = parse_nul_list(&out);
        files.sort();
        files.dedup();
        Ok(files)
    }

    pub async fn remote_url(&self) -> Option<String> {
        self.single_line(&["remote", "get-url", "origin"]).await
    }

    pub async fn branch(&self) -> Option<String> {
        self.single_line(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .filter(|b| b != "HEAD")
    }

    /// `(short sha, subject)` of HEAD.
    pub async fn last_commit(&self) -> Option<(String, String)> {
        let out = self
            .access
            .git(&["log", "-1", "--format=%h%n%s"])
            .await
            .ok()?;
        let mut lines = out.lines();
        let sha = lines.next()?.trim().to_string();
        if sha.is_empty() {
            return None;
        }
        let subject = lines.next().unwrap_or("").trim().to_string();
        Some((sha, subject))
    }

    pub async fn repo_info(&self) -> RepoInfo {
        if !self.is_repository().await {
            return RepoInfo::default();
        }
        let (last_commit, last_commit_message) = match self.last_commit().await {
            Some((sha, subject)) => (Some(sha), (!subject.is_empty()).then_some(subject)),
            None => (None, None),
        };
        RepoInfo {
            remote_url: self.remote_url().await,
            branch: self.branch().await,
            last_commit,
            last_commit_message,
        }
    }

    async fn single_line(&self, args: &[&str]) -> Option<String> {
        let out = self.access.git(args).await.ok()?;
        let line = out.lines().next()?.trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

fn parse_nul_list(out: &str) -> Vec<String> {
    out.split('\0')
        .map(|s| s.trim_start_matches("./").to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
