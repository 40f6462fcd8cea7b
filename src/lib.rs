//! # devctx
//!
//! Local code context retrieval for AI assistants.
//!
//! devctx indexes a project directory (or a directory inside a running
//! container) into scope-tagged, embedded chunks and, given a query,
//! assembles a budgeted context block from the most similar ones.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Discovery  │──▶│   Indexing   │──▶│   Snapshot   │
//! │  git / walk │   │ chunk+embed  │   │  store JSON  │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!        ▲                                    │
//!  ┌─────┴──────┐                     ┌───────▼───────┐
//!  │ FileAccess │                     │   Retriever   │
//!  │ local/dock │                     │ context block │
//!  └────────────┘                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML settings, defaults, validated updates |
//! | [`access`] | Local and container file access |
//! | [`vcs`] | Git probing through a [`access::FileAccess`] |
//! | [`discovery`] | Candidate files: git first, walk second, then filters |
//! | [`embedding`] | Local model backends and pipeline construction |
//! | [`snapshot_store`] | JSON-file-backed store |
//! | [`indexer`] | Indexing jobs, their states and cancellation |
//! | [`engine`] | The public facade |
//! | [`status`] | Progress events and sinks |
//! | [`stats`] | Stats rendering for the CLI |
//!
//! Scope model, chunking, the embedding pipeline, the store trait and
//! context assembly live in `devctx-core`.

pub mod access;
pub mod config;
pub mod discovery;
pub mod embedding;
pub mod engine;
pub mod indexer;
pub mod snapshot_store;
pub mod stats;
pub mod status;
pub mod vcs;
