//! # devctx core
//!
//! Pure indexing and retrieval logic for devctx: the scope-tagged data
//! model, the overlapping chunker, the embedding pipeline (primary model
//! slot, deterministic fallback, bounded cache), the [`store::Store`]
//! abstraction with an in-memory backend, and the context assembler.
//!
//! This crate performs no filesystem I/O, spawns no processes, and does
//! not depend on tokio. The `devctx` app crate supplies file access, the
//! on-disk snapshot, the primary embedding model, and the indexing
//! controller.

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod index;
pub mod models;
pub mod store;
pub mod tree;
