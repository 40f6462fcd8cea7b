//! File-tree snapshot rows and their text rendering.

use std::collections::BTreeMap;

use crate::models::{FileTreeEntry, Scope};

/// Expand a list of scope-relative file paths into tree rows: one row per
/// file plus one per ancestor directory, sorted by path.
pub fn file_tree_entries(scope: &Scope, files: &[String], now: i64) -> Vec<FileTreeEntry> {
    // path -> is_directory
    let mut rows: BTreeMap<String, bool> = BTreeMap::new();
    for file in files {
        let file = file.trim_matches('/');
        if file.is_empty() {
            continue;
        }
        let mut dir = String::new();
        let mut parts = file.split('/').peekable();
        while let Some(part) = parts.next() {
            if part.is_empty() {
                continue;
            }
            if !dir.is_empty() {
                dir.push('/');
            }
            dir.push_str(part);
            let is_dir = parts.peek().is_some();
            // A path seen as a directory stays one.
            let slot = rows.entry(dir.clone()).or_insert(is_dir);
            *slot |= is_dir;
        }
    }

    rows.into_iter()
        .map(|(path, is_directory)| FileTreeEntry {
            scope: scope.clone(),
            parent_path: parent_of(&path).to_string(),
            path,
            is_directory,
            last_indexed: now,
        })
        .collect()
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Render tree rows as an indented listing that fits in `budget` chars.
///
/// Returns `None` when not even the header and one line fit. When the
/// listing is cut short, a final line says how many entries were left out.
pub fn render_tree(entries: &[FileTreeEntry], budget: usize) -> Option<String> {
    const HEADER: &str = "## File tree\n";
    // Room kept for the "… N more entries" line.
    const TRAILER_RESERVE: usize = 32;

    if entries.is_empty() {
        return None;
    }

    let lines: Vec<String> = entries
        .iter()
        .map(|e| {
            let depth = e.path.matches('/').count();
            let name = e.path.rsplit('/').next().unwrap_or(&e.path);
            let slash = if e.is_directory { "/" } else { "" };
            format!("{}{}{}\n", "  ".repeat(depth), name, slash)
        })
        .collect();

    let full: usize = HEADER.len() + lines.iter().map(|l| l.chars().count()).sum::<usize>();
    if full <= budget {
        return Some(format!("{}{}", HEADER, lines.concat()));
    }

    let mut out = String::from(HEADER);
    let mut used = HEADER.len();
    let mut shown = 0usize;
    for line in &lines {
        let len = line.chars().count();
        if used + len + TRAILER_RESERVE > budget {
            break;
        }
        out.push_str(line);
        used += len;
        shown += 1;
    }
    if shown == 0 {
        return None;
    }
    out.push_str(&format!("… {} more entries\n", lines.len() - shown));
    Some(out)
}
