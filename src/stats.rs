//! Index statistics and health overview.
//!
//! A quick summary of what's indexed: chunk and embedding counts, the store
//! file, and a per-scope breakdown. Used by `devctx stats` to give confidence
//! that indexing is working as expected.

use std::fmt::Write;

use crate::engine::{EngineStats, ScopeStats};

/// Render the stats report printed by `devctx stats`.
pub fn render_stats(stats: &EngineStats, scopes: &[ScopeStats]) -> String {
    let mut out = String::new();
    let t = &stats.totals;

    let _ = writeln!(out, "devctx index stats");
    let _ = writeln!(out, "==================");
    let _ = writeln!(out);
    match &stats.store_path {
        Some(path) => {
            let _ = writeln!(out, "  Store:       {}", path.display());
            let _ = writeln!(out, "  Size:        {}", format_bytes(stats.store_bytes));
        }
        None => {
            let _ = writeln!(out, "  Store:       (in memory)");
        }
    }
    let _ = writeln!(out, "  Model:       {} ({} dims)", stats.model, stats.dims);
    let _ = writeln!(
        out,
        "  Retrieval:   {}",
        if stats.config.retrieval.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "  Chunks:      {}", t.total_chunks);
    let _ = writeln!(
        out,
        "  Embedded:    {} / {} ({}%)",
        t.total_embeddings,
        t.total_chunks,
        if t.total_chunks > 0 {
            (t.total_embeddings * 100) / t.total_chunks
        } else {
            0
        }
    );
    let _ = writeln!(out, "  Tree:        {} entries", t.total_tree_entries);
    let _ = writeln!(out, "  Repos:       {}", t.total_repos);

    if !scopes.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  By scope:");
        let _ = writeln!(
            out,
            "  {:<40} {:>8} {:>10} {:>6}   {}",
            "SCOPE", "CHUNKS", "EMBEDDED", "TREE", "LAST INDEXED"
        );
        let _ = writeln!(out, "  {}", "-".repeat(84));
        for s in scopes {
            let indexed = match s.last_indexed {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            let _ = writeln!(
                out,
                "  {:<40} {:>8} {:>10} {:>6}   {}",
                truncate_left(&s.scope.key(), 40),
                s.stats.total_chunks,
                s.stats.total_embeddings,
                s.stats.total_tree_entries,
                indexed
            );
        }
    }
    out
}

/// Keep the tail of long scope keys; the end of a path is the useful part.
fn truncate_left(s: &str, width: usize) -> String {
    let count = s.chars().count();
    if count <= width {
        return s.to_string();
    }
    let tail: String = s.chars().skip(count - (width - 1)).collect();
    format!("…{}", tail)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
