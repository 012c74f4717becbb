use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use liveboard_core::{CollectionReport, IngestionResult};
use liveboard_provider::IrailClient;
use liveboard_store::{MemoryStore, PgBulkStore};
use liveboard_sync::{
    collect_all_scoped, collect_station_scoped, CollectionOrchestrator, CollectorConfig, LiveResources,
    PipelineError, ResourceFactory,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "liveboard")]
#[command(about = "Collects live train departures into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect every configured station once.
    Collect {
        /// Validate and count without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Collect a single station by id or display name.
    Station {
        name: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the HTTP API (and the scheduler when enabled).
    Serve,
    /// Apply database migrations.
    Migrate,
}

/// Real provider, in-memory store.
struct DryRunResources;

#[async_trait]
impl ResourceFactory for DryRunResources {
    async fn acquire(&self, config: Arc<CollectorConfig>) -> Result<CollectionOrchestrator, PipelineError> {
        let provider = IrailClient::new(config.provider_config())?;
        Ok(CollectionOrchestrator::new(
            config,
            Arc::new(provider),
            Arc::new(MemoryStore::new()),
        ))
    }
}

fn resources(dry_run: bool) -> Box<dyn ResourceFactory> {
    if dry_run {
        Box::new(DryRunResources)
    } else {
        Box::new(LiveResources)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = Arc::new(CollectorConfig::from_env().context("loading configuration")?);

    match cli.command.unwrap_or(Commands::Collect { dry_run: false }) {
        Commands::Collect { dry_run } => {
            let report = collect_all_scoped(resources(dry_run).as_ref(), config).await;
            print_report(&report);
        }
        Commands::Station { name, dry_run } => {
            let result = collect_station_scoped(resources(dry_run).as_ref(), config, &name).await?;
            print_result(&result);
        }
        Commands::Serve => {
            liveboard_web::serve(config, Arc::new(LiveResources)).await?;
        }
        Commands::Migrate => {
            let store = PgBulkStore::connect(&config.database_url, config.pool_config()).await?;
            let applied = store.migrate().await?;
            println!("migrations applied: {applied}");
        }
    }

    Ok(())
}

fn print_result(result: &IngestionResult) {
    match &result.failure {
        None => println!(
            "{:<24} ok      fetched={} stored={} inserted={} updated={} discarded={} {}ms",
            result.station_id,
            result.fetched,
            result.persisted,
            result.inserted,
            result.updated,
            result.discarded.total(),
            result.elapsed_ms
        ),
        Some(failure) => println!(
            "{:<24} failed  {}: {}",
            result.station_id, failure.kind, failure.message
        ),
    }
}

fn print_report(report: &CollectionReport) {
    for result in &report.results {
        print_result(result);
    }
    println!(
        "run {} complete: stations={} succeeded={} failed={} persisted={}",
        report.run_id,
        report.results.len(),
        report.succeeded(),
        report.failed(),
        report.total_persisted()
    );
}
