//! # devctx CLI
//!
//! Index a local project or a running container, then pull a budgeted,
//! relevance-ranked context block out of it for an AI assistant.
//!
//! ## Usage
//!
//! ```bash
//! devctx [--config settings.toml] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `devctx index [path]` | Index a local directory (default: current dir) |
//! | `devctx index --container <id> --workdir <dir>` | Index a directory inside a container |
//! | `devctx context "<query>"` | Print the assembled context block |
//! | `devctx search "<query>"` | Print ranked matches |
//! | `devctx stats` | Show totals and a per-scope breakdown |
//! | `devctx config show` / `set k=v` | Inspect or change settings |
//! | `devctx clear --path/--container/--all` | Drop indexed data |
//!
//! Logs go to stderr. `RUST_LOG` overrides `-v`/`-vv`.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use devctx::config::{default_config_path, ConfigPatch, ConfigStore};
use devctx::engine::{project_root, ContextEngine};
use devctx::indexer::JobState;
use devctx::stats::render_stats;
use devctx::status::StatusMode;
use devctx_core::context::format_hit;
use devctx_core::models::Scope;

/// devctx: local code context retrieval for AI assistants.
#[derive(Parser)]
#[command(name = "devctx", version, about)]
struct Cli {
    /// Settings file (TOML). Defaults to `$DEVCTX_CONFIG` or
    /// `~/.config/devctx/settings.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging: -v for info, -vv for debug.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use only the built-in hash embedder; never load or download a model.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index a project directory or a container working directory.
    Index {
        /// Project directory (default: current directory).
        path: Option<PathBuf>,

        /// Index inside this running container instead.
        #[arg(long, conflicts_with = "path", requires = "workdir")]
        container: Option<String>,

        /// Working directory inside the container.
        #[arg(long)]
        workdir: Option<String>,

        /// Progress output on stderr.
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },

    /// Print the context block for a query.
    Context {
        query: String,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Maximum characters of context.
        #[arg(long, default_value_t = 8000)]
        budget: usize,
    },

    /// Print ranked matches for a query.
    Search {
        query: String,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Number of matches (default: retrieval.top_k).
        #[arg(long)]
        limit: Option<usize>,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics.
    Stats {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or change settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Delete indexed data for one scope or everything.
    Clear {
        /// Clear the project rooted here.
        #[arg(long, conflicts_with_all = ["container", "all"])]
        path: Option<PathBuf>,

        /// Clear this container's scope.
        #[arg(long, conflicts_with = "all")]
        container: Option<String>,

        /// Clear every scope.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings as TOML.
    Show,
    /// Set one or more values, e.g. `retrieval.top_k=12`.
    Set {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
}

#[derive(Args)]
struct ScopeArgs {
    /// Project directory (default: current directory).
    #[arg(long, conflicts_with = "container")]
    path: Option<PathBuf>,

    /// Container ID.
    #[arg(long)]
    container: Option<String>,
}

impl ScopeArgs {
    fn scope(&self) -> Result<Scope> {
        if let Some(id) = &self.container {
            return Ok(Scope::container(id));
        }
        let path = match &self.path {
            Some(p) => p.clone(),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        Ok(Scope::project(project_root(&path).to_string_lossy()))
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Off,
    Human,
    Json,
}

impl From<StatusArg> for StatusMode {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Off => StatusMode::Off,
            StatusArg::Human => StatusMode::Human,
            StatusArg::Json => StatusMode::Json,
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = ConfigStore::open(&config_path)?;

    // Settings commands never touch the index or the model.
    if let Command::Config { action } = &cli.command {
        match action {
            ConfigAction::Show => {
                let body = toml::to_string_pretty(&config.get())
                    .context("Failed to serialize config")?;
                print!("{}", body);
            }
            ConfigAction::Set { assignments } => {
                let mut patch = ConfigPatch::default();
                for a in assignments {
                    let Some((key, value)) = a.split_once('=') else {
                        bail!("Expected key=value, got '{}'", a);
                    };
                    patch.set(key.trim(), value.trim())?;
                }
                config.update(&patch)?;
                println!("Updated {}", config_path.display());
            }
        }
        return Ok(());
    }

    let engine = Arc::new(if cli.offline {
        ContextEngine::open_offline(config).await?
    } else if matches!(cli.command, Command::Index { .. }) {
        ContextEngine::open(config).await?
    } else {
        ContextEngine::open_lazy(config).await?
    });

    match cli.command {
        Command::Index {
            path,
            container,
            workdir,
            status,
        } => {
            let mode = status.map(StatusMode::from).unwrap_or_else(StatusMode::default_for_tty);
            let sink = mode.sink();

            let aborter = engine.clone();
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Aborting after the current file...");
                    aborter.abort_indexing();
                }
            });

            let result = match container {
                Some(id) => {
                    let workdir = workdir.unwrap_or_else(|| "/".to_string());
                    engine.index_container(&id, &workdir, sink.as_ref()).await
                }
                None => {
                    let root = match path {
                        Some(p) => p,
                        None => std::env::current_dir().context("Failed to read current directory")?,
                    };
                    engine.index_project(&root, sink.as_ref()).await
                }
            };
            ctrl_c.abort();

            let report = result?;
            println!(
                "{}: {} files indexed, {} skipped, {} chunks ({} ms, via {})",
                if report.outcome == JobState::Aborted {
                    "Aborted"
                } else {
                    "Indexed"
                },
                report.files_indexed,
                report.files_skipped,
                report.chunks_written,
                report.elapsed_ms,
                report.strategy
            );
        }
        Command::Context {
            query,
            scope,
            budget,
        } => {
            let scope = scope.scope()?;
            let block = engine.build_context(&query, &scope, budget).await?;
            if block.is_empty() {
                eprintln!("No context for {}.", scope);
            } else {
                print!("{}", block);
            }
        }
        Command::Search {
            query,
            scope,
            limit,
            json,
        } => {
            let scope = scope.scope()?;
            let hits = engine.search(&query, &scope, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No results.");
            } else {
                let max_chars = engine.get_config().retrieval.max_excerpt_chars;
                for hit in &hits {
                    println!("{}", format_hit(hit, max_chars));
                }
            }
        }
        Command::Stats { json } => {
            let stats = engine.get_stats().await?;
            let scopes = engine.scope_stats().await?;
            if json {
                let body = serde_json::json!({ "totals": stats, "scopes": scopes });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                print!("{}", render_stats(&stats, &scopes));
            }
        }
        Command::Clear {
            path,
            container,
            all,
        } => {
            if all {
                engine.clear_all().await?;
                println!("Cleared all scopes.");
            } else {
                let scope = match (path, container) {
                    (_, Some(id)) => Scope::container(id),
                    (Some(p), None) => Scope::project(project_root(&p).to_string_lossy()),
                    (None, None) => bail!("Specify --path, --container, or --all"),
                };
                engine.clear_scope(&scope).await?;
                println!("Cleared {}.", scope);
            }
        }
        Command::Config { .. } => {}
    }

    Ok(())
}
