//! Pipeline CLI - USDA QuickStats extract, transform and load
//!
//! Usage:
//!   # Full run (clear staging, extract all tasks, transform, replace table):
//!   cargo run --bin pipeline -- run
//!
//!   # Individual stages:
//!   cargo run --bin pipeline -- extract
//!   cargo run --bin pipeline -- extract --keep-staging
//!   cargo run --bin pipeline -- transform
//!   cargo run --bin pipeline -- load
//!   cargo run --bin pipeline -- load --commodity CORN --region IOWA
//!
//!   # Smaller task set from a JSON file:
//!   cargo run --bin pipeline -- --config config/tasks.json run

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline::artifact::CanonicalArtifact;
use pipeline::config::PipelineConfig;
use pipeline::extract::{Extractor, QuickStatsClient};
use pipeline::load::{Loader, PgStore};
use pipeline::logging::init_logging;
use pipeline::model::ReplaceScope;
use pipeline::orchestrator::{Orchestrator, RunReport, RunState};
use pipeline::staging::{FsStaging, StagingArea};
use pipeline::transform::Transformer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pipeline", about = "Extracts, normalizes and loads USDA QuickStats data")]
struct Args {
    /// JSON file overriding commodities, metrics, regions and years
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract, transform and load every configured task
    Run,
    /// Fetch every task into a cleared staging area
    Extract {
        /// Keep batches already staged instead of clearing them first
        #[arg(long, default_value = "false")]
        keep_staging: bool,
    },
    /// Normalize staged batches into the canonical CSV
    Transform,
    /// Load the canonical CSV into the destination table
    Load {
        /// Replace only this commodity (requires --region)
        #[arg(long, requires = "region")]
        commodity: Option<String>,

        /// Replace only this region name, e.g. IOWA (requires --commodity)
        #[arg(long, requires = "commodity")]
        region: Option<String>,
    },
    /// Check the database connection and create the table if missing
    CheckDb,
    /// Print the task set without fetching
    Tasks,
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = path {
        config
            .apply_task_file(path)
            .context("Failed to apply task file")?;
    }
    Ok(config)
}

fn build_extractor(config: &PipelineConfig, staging: Arc<dyn StagingArea>) -> Result<Extractor> {
    let api_key = config.require_api_key()?.clone();
    let client = QuickStatsClient::new(&config.extract, api_key).context("Failed to build HTTP client")?;
    Ok(Extractor::new(Arc::new(client), staging, &config.extract))
}

async fn connect_store(config: &PipelineConfig) -> Result<PgStore> {
    let store = PgStore::connect(config.require_db_url()?, &config.load.table)
        .await
        .context("Failed to connect to database")?;
    store
        .ensure_schema()
        .await
        .context("Failed to create destination table")?;
    Ok(store)
}

fn print_report(report: &RunReport) {
    println!("\n=== Pipeline Summary ===");
    println!("Run ID: {}", report.run_id);
    println!("Status: {}", report.state);
    println!(
        "Tasks: {} total, {} fetched ({} without data), {} failed",
        report.tasks_total,
        report.tasks_fetched,
        report.tasks_empty,
        report.task_failures.len()
    );
    for failure in &report.task_failures {
        let kind = if failure.transient { "transient" } else { "permanent" };
        println!("  ✗ {} [{}] {}", failure.task, kind, failure.cause);
    }
    if report.batches_failed > 0 {
        println!("Unreadable staged batches: {}", report.batches_failed);
    }
    println!("Rows produced: {}", report.rows_produced);
    println!("Rows dropped: {}", report.rows_dropped);
    println!("Rows loaded: {}", report.rows_loaded);
    if let Some(error) = &report.load_error {
        println!("Load error: {}", error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.json_logs);
    let config = load_config(args.config.as_ref())?;

    let staging: Arc<dyn StagingArea> = Arc::new(FsStaging::new(&config.staging_dir));
    let artifact = CanonicalArtifact::new(&config.processed_path);
    let transformer = Transformer::new(&config.transform);

    match args.command {
        Command::Run => {
            let extractor = build_extractor(&config, staging.clone())?;
            let store = connect_store(&config).await?;
            let orchestrator = Orchestrator::new(
                config.tasks(),
                extractor,
                staging,
                transformer,
                artifact,
                Loader::new(Arc::new(store), config.load.chunk_size),
            );

            let report = orchestrator.run().await?;
            print_report(&report);
            debug_assert!(report.state.is_terminal());
            if report.state == RunState::Failed {
                anyhow::bail!("Load failed after {} rows; re-run the pipeline", report.rows_loaded);
            }
        }
        Command::Extract { keep_staging } => {
            let extractor = build_extractor(&config, staging)?;
            let tasks = config.tasks();
            let results = if keep_staging {
                warn!("keeping previously staged batches; they will be part of the next transform");
                extractor.fetch_all(&tasks).await
            } else {
                extractor.extract_fresh(&tasks).await?
            };
            let saved = results.iter().filter(|r| r.is_ok()).count();

            println!("\n=== Extraction Summary ===");
            println!("Saved: {} of {} tasks to {}", saved, tasks.len(), config.staging_dir.display());
            for (task, result) in tasks.iter().zip(&results) {
                if let Err(e) = result {
                    println!("  ✗ {}: {}", task, e);
                }
            }
        }
        Command::Transform => {
            let output = transformer
                .transform_to_artifact(staging.as_ref(), &artifact)
                .await?;
            if output.dataset.is_empty() {
                println!("No valid files found to process. Removed {}", artifact.path().display());
                return Ok(());
            }

            println!("\n=== Transform Summary ===");
            println!("Batches: {} ({} unreadable)", output.stats.batches_read, output.stats.batches_failed);
            println!("Rows kept: {}", output.stats.rows_out);
            println!("Rows dropped: {}", output.stats.rows_dropped());
            println!("Saved combined CSV to {}", artifact.path().display());
        }
        Command::Load { commodity, region } => {
            let scope = match (commodity, region) {
                (Some(commodity), Some(region)) => ReplaceScope::subset(&commodity, &region),
                _ => ReplaceScope::Everything,
            };

            let dataset = artifact
                .read()
                .await
                .context("Failed to read canonical dataset; run `transform` first")?;
            if dataset.is_empty() {
                println!("The dataset is empty. No records were inserted.");
                return Ok(());
            }

            let store = connect_store(&config).await?;
            let loader = Loader::new(Arc::new(store), config.load.chunk_size);
            info!(%scope, rows = dataset.len(), "loading");
            let result = loader.load(&dataset, &scope).await?;

            println!("\n=== Load Summary ===");
            println!("Scope: {}", scope);
            println!("Deleted: {}", result.deleted);
            println!("Inserted: {} rows in {} chunks", result.rows_loaded, result.chunks);
            if result.rows_skipped > 0 {
                println!("Outside scope (not loaded): {}", result.rows_skipped);
            }
        }
        Command::CheckDb => {
            let store = connect_store(&config).await?;
            let now = store.server_time().await?;
            println!("Database connection successful! Server time: {}", now);
        }
        Command::Tasks => {
            let tasks = config.tasks();
            for (i, task) in tasks.iter().enumerate() {
                println!("[{}/{}] {} -> {}", i + 1, tasks.len(), task, task.staging_key());
            }
        }
    }

    Ok(())
}
