//! Artwork cache - resolution server and operator commands.
//!
//! `serve` runs the HTTP API with periodic eviction; `migrate` drives the
//! backfill job; `evict`, `stats` and `purge` are one-shot maintenance.

use anyhow::{Context, Result};
use artwork_core::{
    ArtworkCache, ArtworkCacheConfig, CancellationToken, EvictOptions, MigrationState,
    SqliteCatalog,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "artwork-cache")]
#[command(about = "Album artwork cache: resolution server and backfill")]
struct Args {
    /// JSON config file (missing keys use defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Album database, opened read-only
    #[arg(long, global = true, default_value = "data/tracklist.db")]
    catalog: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the resolution API and cached files
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Do not run periodic eviction
        #[arg(long)]
        no_eviction: bool,
    },
    /// Backfill artwork for the whole catalog
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Run one eviction sweep
    Evict {
        /// Report what would be removed without deleting anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Print cache statistics
    Stats,
    /// Remove every cached file of an album
    Purge { album_id: i64 },
}

#[derive(Subcommand, Debug)]
enum MigrateAction {
    /// Start or resume the backfill
    Run,
    /// Print checkpoint and last report; succeeds only if complete
    Status,
    /// Delete the checkpoint (cached files are kept)
    Reset,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    // Command output goes to stdout; logs go to the subscriber
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_cache(args: &Args) -> Result<Arc<ArtworkCache>> {
    let config = match &args.config {
        Some(path) => ArtworkCacheConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ArtworkCacheConfig::default(),
    };
    let catalog = SqliteCatalog::open(&args.catalog)
        .with_context(|| format!("opening album catalog {}", args.catalog.display()))?;

    let cache = ArtworkCache::builder(config)
        .catalog(Arc::new(catalog))
        .build()
        .await?;
    Ok(Arc::new(cache))
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, abandoning in-flight albums; they are retried on resume");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.debug);

    let cache = open_cache(&args).await?;

    match &args.command {
        Command::Serve {
            port,
            host,
            no_eviction,
        } => {
            let daemon = (!no_eviction).then(|| cache.start_eviction_daemon());
            let addr = artwork_server::start_server(cache.clone(), host, *port).await?;
            info!("Artwork server running on {}", addr);

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
            if let Some(daemon) = daemon {
                daemon.join().await;
            }
        }
        Command::Migrate { action } => match action {
            MigrateAction::Run => {
                let cancel = CancellationToken::new();
                cancel_on_ctrl_c(cancel.clone());
                let report = cache.migration().run(&cancel).await?;
                print_json(&report)?;
                let state = cache.migration().status()?.state();
                if state != MigrationState::Completed {
                    return Ok(ExitCode::FAILURE);
                }
            }
            MigrateAction::Status => {
                let status = cache.migration().status()?;
                print_json(&status)?;
                if !status.is_complete() {
                    return Ok(ExitCode::FAILURE);
                }
            }
            MigrateAction::Reset => {
                let removed = cache.migration().reset()?;
                info!(
                    "{}",
                    if removed {
                        "Migration checkpoint cleared"
                    } else {
                        "No migration checkpoint to clear"
                    }
                );
            }
        },
        Command::Evict { dry_run } => {
            let sweeper = cache.clone();
            let options = EvictOptions { dry_run: *dry_run };
            let report = tokio::task::spawn_blocking(move || sweeper.evict(options)).await??;
            print_json(&report)?;
        }
        Command::Stats => {
            let stats = cache.stats()?;
            print_json(&stats)?;
            let problems = cache.verify_structure();
            if !problems.is_empty() {
                warn!("Cache structure problems: {:?}", problems);
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Purge { album_id } => {
            let report = cache.purge_album(*album_id)?;
            print_json(&report)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
