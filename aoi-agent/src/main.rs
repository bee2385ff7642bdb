//! aoi-agent - AOI inference agent
//!
//! Sends panel photographs to the segmentation service, turns the returned
//! defect mask into per-category regions and stores them. Results are printed
//! as JSON on stdout; logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use aoi_agent::services::ImageScanner;
use aoi_agent::{db, AgentConfig, AgentContext};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for aoi-agent
#[derive(Parser, Debug)]
#[command(name = "aoi-agent")]
#[command(about = "AOI inference agent: defect extraction, result store and batch export")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "AOI_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect a single image
    Process { file: PathBuf },
    /// Inspect several images (directories are scanned for images)
    Batch {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Bundle a batch's results into a ZIP archive
    Export { batch_id: String },
    /// Show an image with its classes and regions
    Show { image_id: String },
    /// List the most recent images
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Delete an image, its regions and its artifacts
    Delete { image_id: String },
    /// Remove stored files and records older than the given age
    Cleanup {
        #[arg(long)]
        days: u32,
    },
    /// Check database connectivity
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config = aoi_common::config::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Logging starts before AgentConfig validation so its warnings are visible
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| toml_config.logging.level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("aoi_agent={level},aoi_common={level}", level = level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting aoi-agent {}", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::from_toml(&toml_config).context("Invalid configuration")?;
    info!(
        inference = %config.inference.base_url,
        database = %config.database.path.display(),
        "Configuration resolved"
    );

    let ctx = AgentContext::new(config)
        .await
        .context("Failed to initialize agent")?;

    let outcome = run(&ctx, args.command).await;
    ctx.db.close().await;
    outcome
}

async fn run(ctx: &AgentContext, command: Command) -> Result<()> {
    match command {
        Command::Process { file } => {
            let processed = ctx.pipeline.process_file(&file).await.map_err(|e| {
                error!(stage = %e.stage(), recoverable = e.is_recoverable(), "{}", e);
                anyhow::anyhow!("{} failed at {} stage: {}", file.display(), e.stage(), e)
            })?;
            print_json(&processed)
        }
        Command::Batch { inputs } => {
            let items = ImageScanner::new(&ctx.config.storage.allowed_extensions)
                .collect_items(&inputs)
                .context("Failed to collect batch inputs")?;
            let summary = ctx
                .orchestrator
                .run(items)
                .await
                .context("Batch failed")?;
            print_json(&summary)
        }
        Command::Export { batch_id } => {
            let archive = ctx
                .orchestrator
                .export(&batch_id)
                .await
                .with_context(|| format!("Failed to export batch {}", batch_id))?;
            print_json(&serde_json::json!({ "batch_id": batch_id, "archive": archive }))
        }
        Command::Show { image_id } => {
            let hierarchy = db::get_image(&ctx.db, &image_id)
                .await
                .with_context(|| format!("Failed to load image {}", image_id))?;
            print_json(&hierarchy)
        }
        Command::List { limit } => {
            let images = db::list_images(&ctx.db, limit)
                .await
                .context("Failed to list images")?;
            print_json(&images)
        }
        Command::Delete { image_id } => {
            ctx.delete_image(&image_id)
                .await
                .with_context(|| format!("Failed to delete image {}", image_id))?;
            print_json(&serde_json::json!({ "deleted": image_id }))
        }
        Command::Cleanup { days } => {
            let report = ctx.cleanup(days).await.context("Cleanup failed")?;
            print_json(&report)
        }
        Command::Check => {
            aoi_common::db::check_connection(&ctx.db)
                .await
                .context("Database check failed")?;
            print_json(&serde_json::json!({ "database": "ok" }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}
