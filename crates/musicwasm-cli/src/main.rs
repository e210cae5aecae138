//! musicwasm — drive the music engine from the command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use musicwasm_engine::version::EMBEDDED_SENTINEL;
use musicwasm_engine::{
    Engine, EngineConfig, EngineServices, EngineVersion, MusicService, RefreshOutcome, UpdateMode,
};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "musicwasm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file; `MUSICWASM_*` variables still apply on top
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the engine state and whether an update is pending
    Status,

    /// Check for a newer module version and activate it
    Update {
        /// Only report the pending version
        #[arg(long)]
        manual: bool,
    },

    /// Search the catalog
    Search {
        keyword: String,

        #[arg(long, default_value = "all")]
        scope: String,

        #[arg(long)]
        continuation: Option<String>,
    },

    /// Track details with playable formats
    Details { vid: String },

    /// Search suggestions for a prefix
    Suggest { keyword: String },

    /// Tracks of a playlist
    Tracks {
        pid: String,

        #[arg(long)]
        continuation: Option<String>,
    },

    /// Browse a discover category
    Discover {
        category: String,

        #[arg(long)]
        continuation: Option<String>,
    },

    /// Options the module exposes
    Options,

    /// Delete a cached module version
    Remove { id: String },
}

#[derive(Serialize)]
struct Status {
    state: String,
    active: Option<EngineVersion>,
    pending: Option<EngineVersion>,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::from_default_env(),
        1 => EnvFilter::new("musicwasm_engine=debug,info"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn version_for_id(id: &str) -> EngineVersion {
    if id == EMBEDDED_SENTINEL {
        EngineVersion::embedded()
    } else {
        EngineVersion::new(id, id, String::new())
    }
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            engine.load(None).await?;
            let pending = engine.check_for_update().await?;
            print_json(&Status {
                state: engine.state().to_string(),
                active: engine.active_version(),
                pending,
            })?;
        }
        Commands::Update { manual } => {
            let mode = if manual {
                UpdateMode::Manual
            } else {
                UpdateMode::Automatic
            };
            let (outcome, version) = match engine.refresh(mode).await? {
                RefreshOutcome::UpToDate(v) => ("up_to_date", v),
                RefreshOutcome::UpdateAvailable(v) => ("update_available", v),
                RefreshOutcome::Updated(v) => ("updated", v),
            };
            print_json(&serde_json::json!({ "outcome": outcome, "version": version }))?;
        }
        Commands::Search {
            keyword,
            scope,
            continuation,
        } => {
            engine.load(None).await?;
            let page = engine
                .search(&keyword, &scope, continuation.as_deref())
                .await?;
            print_json(&page)?;
        }
        Commands::Details { vid } => {
            engine.load(None).await?;
            print_json(&engine.details(&vid).await?)?;
        }
        Commands::Suggest { keyword } => {
            engine.load(None).await?;
            print_json(&engine.suggestion(&keyword).await?)?;
        }
        Commands::Tracks { pid, continuation } => {
            engine.load(None).await?;
            print_json(&engine.tracks(&pid, continuation.as_deref()).await?)?;
        }
        Commands::Discover {
            category,
            continuation,
        } => {
            engine.load(None).await?;
            print_json(&engine.discover(&category, continuation.as_deref()).await?)?;
        }
        Commands::Options => {
            engine.load(None).await?;
            print_json(&engine.options().await?)?;
        }
        Commands::Remove { id } => {
            engine
                .remove(&version_for_id(&id))
                .await
                .with_context(|| format!("failed to remove version {id}"))?;
            tracing::info!(version = %id, "removed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => EngineConfig::from_env(),
    };
    tracing::debug!(cache_dir = %config.cache_dir.display(), "configuration loaded");

    let services = EngineServices::production(&config).context("failed to open state store")?;
    let engine = Engine::new(config, services);

    let result = run(&engine, cli.command).await;
    if let Err(e) = engine.release().await {
        tracing::warn!("engine release failed: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_search() {
        let cli = Cli::parse_from(["musicwasm", "-v", "search", "ways", "--continuation", "c1"]);
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Search {
                keyword,
                scope,
                continuation,
            } => {
                assert_eq!(keyword, "ways");
                assert_eq!(scope, "all");
                assert_eq!(continuation.as_deref(), Some("c1"));
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_version_for_id() {
        assert!(version_for_id("embedded").is_embedded());
        let v = version_for_id("42");
        assert_eq!(v.id, "42");
        assert!(!v.is_embedded());
    }
}
