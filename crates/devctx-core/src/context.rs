//! Retrieval and budgeted context assembly.
//!
//! [`build_context`] embeds a query, ranks the scope's chunks with
//! [`Store::similarity_search`], and greedily packs excerpts into a single
//! string for a downstream model.
//!
//! # Packing
//!
//! 1. Excerpts are appended in descending-similarity order.
//! 2. The first excerpt that would push the output past `max_budget` stops
//!    packing; a single notice line records how many matches were left out.
//!    No smaller later match is tried in its place.
//! 3. The file-tree block (capped at `tree_budget`) and the repository block
//!    are appended only if they fit in what remains of `max_budget`.
//!
//! The output therefore never exceeds `max_budget` by more than the notice
//! line. Sizes are measured in characters.

use anyhow::Result;

use crate::embedding::EmbeddingPipeline;
use crate::models::{RepoMetadata, Scope, SearchHit};
use crate::store::Store;
use crate::tree::render_tree;

/// Retrieval knobs for one [`build_context`] call.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub top_k: usize,
    pub min_similarity: f32,
    /// Maximum characters of assembled context.
    pub max_budget: usize,
    /// Excerpts longer than this are cut and marked.
    pub max_excerpt_chars: usize,
    pub tree_budget: usize,
    pub include_tree: bool,
    pub include_repo: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            top_k: 8,
            min_similarity: 0.3,
            max_budget: 8000,
            max_excerpt_chars: 1200,
            tree_budget: 2000,
            include_tree: true,
            include_repo: true,
        }
    }
}

const MATCHES_HEADER: &str = "## Relevant code\n\n";

/// Embed `query` and rank `scope`'s chunks against it.
pub async fn retrieve<S: Store + ?Sized>(
    store: &S,
    pipeline: &EmbeddingPipeline,
    scope: &Scope,
    query: &str,
    top_k: usize,
    min_similarity: f32,
) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let query_vec = pipeline.embed(query).await?;
    store
        .similarity_search(scope, &query_vec, top_k, min_similarity)
        .await
}

/// Assemble the context block for `query` within `scope`.
///
/// Returns an empty string when the scope has nothing indexed. This is a
/// pure read path.
pub async fn build_context<S: Store + ?Sized>(
    store: &S,
    pipeline: &EmbeddingPipeline,
    scope: &Scope,
    query: &str,
    opts: &ContextOptions,
) -> Result<String> {
    let stats = store.stats(Some(scope)).await?;
    if stats.total_chunks == 0 && stats.total_tree_entries == 0 && stats.total_repos == 0 {
        return Ok(String::new());
    }

    let hits = retrieve(store, pipeline, scope, query, opts.top_k, opts.min_similarity).await?;

    let mut out = String::new();
    let mut used = 0usize;

    for (i, hit) in hits.iter().enumerate() {
        let mut block = String::new();
        if i == 0 {
            block.push_str(MATCHES_HEADER);
        }
        block.push_str(&format_hit(hit, opts.max_excerpt_chars));

        let len = block.chars().count();
        if used + len > opts.max_budget {
            let omitted = hits.len() - i;
            let notice = format!(
                "[{} more {} omitted to fit the context budget]\n",
                omitted,
                if omitted == 1 { "match" } else { "matches" }
            );
            used += notice.chars().count();
            out.push_str(&notice);
            break;
        }
        out.push_str(&block);
        used += len;
    }

    if opts.include_tree && stats.total_tree_entries > 0 {
        let remaining = opts.max_budget.saturating_sub(used);
        let entries = store.file_tree(scope).await?;
        let budget = opts.tree_budget.min(remaining.saturating_sub(1));
        if let Some(tree) = render_tree(&entries, budget) {
            push_section(&mut out, &mut used, &tree);
        }
    }

    if opts.include_repo {
        if let Some(meta) = store.repo_metadata(scope).await? {
            if let Some(block) = format_repo(&meta) {
                let len = block.chars().count() + separator_len(&out);
                if used + len <= opts.max_budget {
                    push_section(&mut out, &mut used, &block);
                }
            }
        }
    }

    tracing::debug!(%scope, hits = hits.len(), chars = used, "context assembled");
    Ok(out)
}

fn separator_len(out: &str) -> usize {
    if out.is_empty() {
        0
    } else {
        1
    }
}

fn push_section(out: &mut String, used: &mut usize, block: &str) {
    if !out.is_empty() {
        out.push('\n');
        *used += 1;
    }
    out.push_str(block);
    *used += block.chars().count();
}

/// One excerpt: path, chunk position, similarity, and capped content.
pub fn format_hit(hit: &SearchHit, max_excerpt_chars: usize) -> String {
    let total = hit.content.chars().count();
    let (excerpt, cut) = if total > max_excerpt_chars {
        let head: String = hit.content.chars().take(max_excerpt_chars).collect();
        (head, true)
    } else {
        (hit.content.clone(), false)
    };

    let mut block = format!(
        "### {} (chars {}-{}, similarity {:.3})\n```\n{}",
        hit.file_path, hit.start, hit.end, hit.similarity, excerpt
    );
    if !block.ends_with('\n') {
        block.push('\n');
    }
    if cut {
        block.push_str("…\n");
    }
    block.push_str("```\n\n");
    block
}

fn format_repo(meta: &RepoMetadata) -> Option<String> {
    if meta.info.is_empty() {
        return None;
    }
    let mut block = String::from("## Repository\n");
    if let Some(url) = &meta.info.remote_url {
        block.push_str(&format!("remote: {}\n", url));
    }
    if let Some(branch) = &meta.info.branch {
        block.push_str(&format!("branch: {}\n", branch));
    }
    match (&meta.info.last_commit, &meta.info.last_commit_message) {
        (Some(sha), Some(msg)) => block.push_str(&format!("last commit: {} {}\n", sha, msg)),
        (Some(sha), None) => block.push_str(&format!("last commit: {}\n", sha)),
        (None, Some(msg)) => block.push_str(&format!("last commit: {}\n", msg)),
        (None, None) => {}
    }
    Some(block)
}
