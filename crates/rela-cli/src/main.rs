use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rela_adapters::SearchFilters;
use rela_core::{OperationType, PropertyType};
use rela_storage::PgStore;
use rela_sync::{PipelineConfig, PipelineContext, RunRequest};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rela-cli")]
#[command(about = "Real-estate listing ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations and register the sources from sources.yaml.
    Migrate,
    /// Fetch and stage raw listings without reconciling them.
    Ingest(RunArgs),
    /// Reconcile pending raw listings.
    Process {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        skip_images: bool,
    },
    /// Fetch, stage and reconcile one source.
    Run(RunArgs),
    /// Geocode properties that have an address but no coordinates.
    Geocode {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Reopen errored listings with fewer than `max_attempts` attempts.
    Requeue {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 3)]
        max_attempts: i32,
    },
    Stats,
    /// Run every enabled source on the configured cron until interrupted.
    Schedule,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long)]
    start_offset: Option<u32>,
    #[arg(long)]
    skip_images: bool,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    city: Option<String>,
    #[arg(long)]
    neighborhood: Option<String>,
    #[arg(long)]
    operation: Option<OperationType>,
    #[arg(long)]
    property_type: Option<PropertyType>,
    #[arg(long)]
    min_price: Option<f64>,
    #[arg(long)]
    max_price: Option<f64>,
    #[arg(long)]
    min_rooms: Option<u32>,
    #[arg(long)]
    min_bedrooms: Option<u32>,
}

impl RunArgs {
    fn request(&self) -> RunRequest {
        RunRequest {
            source_id: self.source.clone(),
            filters: SearchFilters {
                state: self.state.clone(),
                city: self.city.clone(),
                neighborhood: self.neighborhood.clone(),
                property_type: self.property_type,
                operation: self.operation,
                min_price: self.min_price,
                max_price: self.max_price,
                min_rooms: self.min_rooms,
                min_bedrooms: self.min_bedrooms,
            },
            limit: self.limit,
            skip_images: self.skip_images,
            start_offset: self.start_offset,
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .try_init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Stats) {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.database_max_connections).await?;
            store.migrate().await?;
            let context = PipelineContext::with_store(config, Arc::new(store))?;
            let seeded = context.seed_sources().await?;
            println!("migrations applied; {seeded} sources registered");
        }
        Commands::Ingest(args) => {
            let context = PipelineContext::connect(config).await?;
            let stats = context.ingest(&args.request()).await?;
            print_json(&stats)?;
            if stats.aborted.is_some() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Process {
            source,
            limit,
            skip_images,
        } => {
            let context = PipelineContext::connect(config).await?;
            let stats = context.process(source.as_deref(), skip_images, limit).await?;
            print_json(&stats)?;
        }
        Commands::Run(args) => {
            let context = PipelineContext::connect(config).await?;
            let summary = context.run(&args.request()).await?;
            print_json(&summary)?;
            if !summary.succeeded() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Geocode { limit } => {
            let context = PipelineContext::connect(config).await?;
            print_json(&context.geocode_missing(limit).await?)?;
        }
        Commands::Requeue { source, max_attempts } => {
            let context = PipelineContext::connect(config).await?;
            let count = context.requeue(source.as_deref(), max_attempts).await?;
            println!("{count} listings requeued");
        }
        Commands::Stats => {
            let context = PipelineContext::connect(config).await?;
            print_json(&context.stats().await?)?;
        }
        Commands::Schedule => {
            let context = Arc::new(PipelineContext::connect(config).await?);
            let Some(mut scheduler) = context.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set RELA_SCHEDULER_ENABLED=true");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %context.config().sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
