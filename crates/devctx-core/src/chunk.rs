//! Overlapping fixed-window text chunker.
//!
//! Splits file content into windows of at most `size` characters, each
//! starting `size - overlap` characters after the previous one, so text
//! that straddles a boundary appears whole in at least one chunk.
//!
//! # Algorithm
//!
//! 1. If the text is at most `size` characters, return it as one chunk.
//! 2. Emit `[start, min(start + size, len))`.
//! 3. Next `start = end - overlap`; if that does not advance past the
//!    current `start`, use `start + 1` instead.
//! 4. Stop at end of text or after `max_chunks` windows. Hitting the
//!    ceiling drops the remainder and logs a warning.
//!
//! Offsets are in characters, not bytes, so multi-byte text is never split
//! inside a code point.
//!
//! # Example
//!
//! ```rust
//! use devctx_core::chunk::{chunk_text, ChunkParams};
//!
//! let text = "x".repeat(2500);
//! let chunks = chunk_text(&text, &ChunkParams::new(1000, 200, 100));
//! let windows: Vec<_> = chunks.iter().map(|c| (c.start, c.end)).collect();
//! assert_eq!(windows, vec![(0, 1000), (800, 1800), (1600, 2500)]);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Window size, overlap and chunk-count ceiling, all in characters / chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    pub size: usize,
    pub overlap: usize,
    pub max_chunks: usize,
}

impl ChunkParams {
    pub fn new(size: usize, overlap: usize, max_chunks: usize) -> Self {
        Self {
            size,
            overlap,
            max_chunks,
        }
    }
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self::new(1000, 200, 200)
    }
}

/// One window of the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    /// Char offset, inclusive.
    pub start: usize,
    /// Char offset, exclusive.
    pub end: usize,
    pub text: String,
}

/// Split `text` into overlapping windows.
///
/// # Guarantees
///
/// - At least one chunk is returned (the whole text when it fits).
/// - Indices are contiguous from 0.
/// - At most `max(params.max_chunks, 1)` chunks are returned.
/// - Terminates for any `overlap`, including `overlap >= size`.
pub fn chunk_text(text: &str, params: &ChunkParams) -> Vec<TextChunk> {
    let size = params.size.max(1);
    let max_chunks = params.max_chunks.max(1);

    // Byte offset of every char boundary, plus the end of the string.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let len = boundaries.len() - 1;

    if len <= size {
        return vec![TextChunk {
            index: 0,
            start: 0,
            end: len,
            text: text.to_string(),
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + size).min(len);
        chunks.push(TextChunk {
            index: chunks.len(),
            start,
            end,
            text: text[boundaries[start]..boundaries[end]].to_string(),
        });

        if end >= len {
            break;
        }

        if chunks.len() >= max_chunks {
            tracing::warn!(
                max_chunks,
                covered = end,
                total = len,
                "chunk ceiling reached, remainder of file dropped"
            );
            break;
        }

        let next = end.saturating_sub(params.overlap);
        start = if next <= start { start + 1 } else { next };
    }

    chunks
}

/// SHA-256 of a chunk's text, hex-encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
