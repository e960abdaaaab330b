use anyhow::Context;
use clap::{Parser, Subcommand};
use sanctions_watch::config::Config;
use sanctions_watch::fetcher::ReqwestFetcher;
use sanctions_watch::orchestrator::{InvocationSummary, Orchestrator};
use sanctions_watch::server::{start_server, AppState};
use sanctions_watch::storage::{EntityFilter, InMemoryStorage, SqliteStorage, Storage};
use sanctions_watch::types::RunStatus;
use sanctions_watch::{logging, metrics};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sanctions_watch")]
#[command(about = "Sanctions watchlist ingestion and change detection")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep everything in memory instead of the SQLite database
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one ingestion invocation and print the summary
    Run {
        /// Specific sources to run (comma-separated). Available: OFAC, BIS, EU
        #[arg(long)]
        sources: Option<String>,
    },
    /// Serve the trigger endpoint
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show recent ingestion runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List stored entities for one source
    Entities {
        #[arg(long)]
        source: String,
        #[arg(long)]
        country: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn open_storage(config: &Config, memory: bool) -> anyhow::Result<Arc<dyn Storage>> {
    if memory {
        return Ok(Arc::new(InMemoryStorage::new()));
    }
    let store = SqliteStorage::open(&config.db_path)
        .with_context(|| format!("opening database at {}", config.db_path))?;
    Ok(Arc::new(store))
}

fn build_orchestrator(config: &Config, storage: Arc<dyn Storage>) -> anyhow::Result<Orchestrator> {
    let fetcher = ReqwestFetcher::new(Duration::from_secs(config.fetch_timeout_secs))?;
    Ok(Orchestrator::from_config(config, storage, Arc::new(fetcher)))
}

fn print_summary(summary: &InvocationSummary) {
    println!("\n📊 Ingestion summary ({} ok, {} failed):", summary.ok, summary.failed);
    for report in &summary.sources {
        let marker = if report.status == RunStatus::Ok { "✅" } else { "❌" };
        println!(
            "   {} {:<6} rows={:<5} skipped={:<4} changed={:<5} checksum={}",
            marker,
            report.source,
            report.rows,
            report.skipped,
            report.changed,
            report.checksum.as_deref().map(|c| &c[..c.len().min(12)]).unwrap_or("-"),
        );
        if let Some(err) = &report.error {
            println!("      error: {}", err);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();
    metrics::init_metrics();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run { sources } => {
            println!("🔄 Running ingestion...");
            let ids: Vec<String> = sources
                .map(|list| list.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            let selected = config.select_sources(&ids);
            if selected.is_empty() {
                anyhow::bail!("no matching sources configured");
            }

            let storage = open_storage(&config, cli.memory)?;
            let orchestrator = build_orchestrator(&config, storage)?;
            let summary = orchestrator.run_all(&selected).await?;
            print_summary(&summary);
            if !summary.success {
                error!(failed = summary.failed, "ingestion finished with failures");
                std::process::exit(1);
            }
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.port);
            if config.trigger_token.is_none() {
                error!("WATCH_TRIGGER_TOKEN is not set; the trigger endpoint will refuse requests");
            }
            let storage = open_storage(&config, cli.memory)?;
            let orchestrator = build_orchestrator(&config, storage.clone())?;
            let state = Arc::new(AppState {
                config,
                storage,
                orchestrator,
            });
            info!(port, "starting trigger server");
            start_server(state, port).await?;
        }
        Commands::Runs { limit } => {
            let storage = open_storage(&config, cli.memory)?;
            let runs = storage.recent_runs(limit).await?;
            println!("\n🗂  {} recent runs:", runs.len());
            for run in runs {
                println!(
                    "   {} {:<6} {:<7} rows={:<5} {}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.source,
                    run.status.as_str(),
                    run.rows,
                    run.error.unwrap_or_default(),
                );
            }
        }
        Commands::Entities {
            source,
            country,
            limit,
        } => {
            let storage = open_storage(&config, cli.memory)?;
            let filter = EntityFilter {
                source: Some(source),
                country,
                limit,
            };
            let entities = storage.list_entities(&filter).await?;
            println!("\n🔎 {} entities:", entities.len());
            for entity in entities {
                println!(
                    "   {:<40} {:<4} {:<12} last seen {}",
                    entity.name,
                    entity.country.as_deref().unwrap_or("-"),
                    entity.program.as_deref().unwrap_or("-"),
                    entity.last_seen.format("%Y-%m-%d"),
                );
            }
        }
    }
    Ok(())
}
