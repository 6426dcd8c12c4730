//! # docintel CLI
//!
//! ```bash
//! docintel --config ./config/docintel.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docintel init` | Write a default config and create the store |
//! | `docintel sync <paths...>` | Ingest files and directories |
//! | `docintel query "<text>"` | Semantic search under a tier ceiling |
//! | `docintel privacy-scan <paths...>` | Classify without storing |
//! | `docintel related <path>` | Documents similar to an indexed one |
//! | `docintel reclassify` | Re-run privacy rules over stored chunks |
//! | `docintel set-tier <path> <tier>` | Explicitly set a document's tier |
//! | `docintel reembed` | Re-embed chunks from another model |
//! | `docintel stats` | Store statistics |
//! | `docintel health` | Component health |
//!
//! Exit codes: `0` success, `1` the report records a failure, `2` aborted
//! run or configuration error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use docintel::config::{self, Config};
use docintel::engine::{self, Engine};
use docintel::error::{EmbeddingError, QueryError};
use docintel::models::PrivacyTier;
use docintel::progress::ProgressMode;
use docintel::query::snippet;
use docintel::stats::print_stats;

/// docintel: local-first document intelligence.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means defaults.
#[derive(Parser)]
#[command(
    name = "docintel",
    about = "docintel: privacy-tiered local document ingestion and semantic search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docintel.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug). `DOCINTEL_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file (if missing) and create the store.
    Init,

    /// Ingest files and directories.
    ///
    /// Unchanged files are skipped by content hash. Ctrl-C stops the run
    /// after the documents in flight.
    Sync {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Minimum tier for every chunk of this run.
        #[arg(long)]
        hint: Option<PrivacyTier>,

        /// Progress on stderr: human, json or off. Default: human on a TTY.
        #[arg(long)]
        progress: Option<ProgressMode>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Semantic search.
    Query {
        text: String,

        /// Highest tier results may have.
        #[arg(long, default_value = "public")]
        max_tier: PrivacyTier,

        #[arg(short)]
        k: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Classify documents without writing anything.
    PrivacyScan {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        hint: Option<PrivacyTier>,

        #[arg(long)]
        json: bool,
    },

    /// Documents related to an indexed document.
    Related {
        path: PathBuf,

        #[arg(long, default_value = "public")]
        max_tier: PrivacyTier,

        #[arg(short)]
        k: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Re-run the privacy rules over stored chunks (tiers only go up).
    Reclassify {
        #[arg(long)]
        json: bool,
    },

    /// Set the tier of every chunk of one document, up or down.
    SetTier { path: PathBuf, tier: PrivacyTier },

    /// Re-embed chunks stored by a different model.
    Reembed {
        #[arg(long)]
        batch: Option<usize>,
    },

    /// Show store statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Check store, catalog and embedding provider.
    Health {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("DOCINTEL_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        debug!(path = %path.display(), "config not found; using defaults");
        Ok(Config::default())
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            if !cli.config.exists() {
                if let Some(parent) = cli.config.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&cli.config, config::DEFAULT_CONFIG).with_context(|| {
                    format!("Failed to write config: {}", cli.config.display())
                })?;
                println!("Wrote {}", cli.config.display());
            }
            let cfg = load(&cli.config)?;
            Engine::open(cfg.clone()).await?;
            println!("Store initialized at {}", cfg.store.dir.display());
            Ok(0)
        }

        Commands::Sync {
            paths,
            hint,
            progress,
            json,
        } => {
            let engine = Engine::open(cfg).await?;
            let token = engine.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing documents in flight");
                    token.cancel();
                }
            });

            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let report = engine.sync(&paths, hint, reporter.as_ref()).await?;
            if json {
                print_json(&report)?;
            } else {
                report.print();
            }
            Ok(report.exit_code() as u8)
        }

        Commands::Query {
            text,
            max_tier,
            k,
            json,
        } => {
            let engine = Engine::open(cfg).await?;
            let result = match engine.query(&text, max_tier, k).await {
                Ok(r) => r,
                Err(QueryError::Embedding(e @ EmbeddingError::ModelMismatch { .. })) => {
                    eprintln!("Error: {}", e);
                    return Ok(1);
                }
                Err(e) => return Err(e.into()),
            };
            if json {
                print_json(&result)?;
            } else if result.hits.is_empty() {
                println!("No results.");
            } else {
                let width = engine.config().retrieval.snippet_chars;
                for (i, hit) in result.hits.iter().enumerate() {
                    println!(
                        "{}. [{:.2}] {} #{} ({})",
                        i + 1,
                        hit.score,
                        hit.source_path,
                        hit.position,
                        hit.tier
                    );
                    println!("    {}", snippet(&hit.text, width));
                }
                if result.incompatible_chunks > 0 {
                    println!(
                        "({} chunks from another model were skipped; run `docintel reembed`)",
                        result.incompatible_chunks
                    );
                }
            }
            Ok(0)
        }

        Commands::PrivacyScan { paths, hint, json } => {
            let report = engine::privacy_scan(&cfg, &paths, hint)?;
            if json {
                print_json(&report)?;
            } else {
                for item in &report.items {
                    match &item.error {
                        Some(err) => println!("{}  error: {}", item.path.display(), err),
                        None => {
                            println!("{}  {}", item.path.display(), item.tier);
                            for s in &item.signals {
                                println!("    {}", s);
                            }
                        }
                    }
                }
            }
            Ok(report.exit_code() as u8)
        }

        Commands::Related {
            path,
            max_tier,
            k,
            json,
        } => {
            let engine = Engine::open(cfg).await?;
            let related = engine.related(&path, max_tier, k).await?;
            if json {
                print_json(&related)?;
            } else if related.is_empty() {
                println!("No related documents.");
            } else {
                for r in &related {
                    println!(
                        "[{:.2}] {}{}",
                        r.score,
                        r.path.display(),
                        if r.linked { "  (linked)" } else { "" }
                    );
                }
            }
            Ok(0)
        }

        Commands::Reclassify { json } => {
            let engine = Engine::open(cfg).await?;
            let report = engine.reclassify().await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "reclassified {} chunks, {} upgraded",
                    report.examined, report.upgraded
                );
            }
            Ok(0)
        }

        Commands::SetTier { path, tier } => {
            let engine = Engine::open(cfg).await?;
            let moved = engine.set_tier(&path, tier).await?;
            println!("{} chunks moved to {}", moved, tier);
            Ok(0)
        }

        Commands::Reembed { batch } => {
            let engine = Engine::open(cfg).await?;
            let updated = engine.reembed(batch).await?;
            println!("re-embedded {} chunks", updated);
            Ok(0)
        }

        Commands::Stats { json } => {
            let engine = Engine::open(cfg).await?;
            let report = engine.stats().await?;
            if json {
                print_json(&report)?;
            } else {
                print_stats(&report);
            }
            Ok(0)
        }

        Commands::Health { json } => {
            let engine = Engine::open(cfg).await?;
            let report = engine.health().await;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "store:    {} ({})",
                    status(report.store.ok, &report.store.error),
                    report.store_dir.display()
                );
                println!("catalog:  {}", status(report.catalog.ok, &report.catalog.error));
                println!(
                    "embedder: {} ({})",
                    status(report.embedder.ok, &report.embedder.error),
                    report.model
                );
                for c in &report.collections {
                    println!(
                        "  {:<10} {}",
                        c.name,
                        if c.available { "ok" } else { "unavailable" }
                    );
                }
                if report.chunks_needing_reembed > 0 {
                    println!("{} chunks need re-embedding", report.chunks_needing_reembed);
                }
            }
            Ok(if report.healthy { 0 } else { 1 })
        }
    }
}

fn status(ok: bool, error: &Option<String>) -> String {
    match (ok, error) {
        (true, _) => "ok".to_string(),
        (false, Some(e)) => format!("FAILED: {}", e),
        (false, None) => "FAILED".to_string(),
    }
}
