use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use leadflow_storage::{BackoffPolicy, CacheStore, SearchIndexClient};
use leadflow_sync::{CdcRelay, IngestMode, IngestPipeline, PipelineConfig};

#[derive(Debug, Parser)]
#[command(name = "leadflow")]
#[command(about = "Lead ingestion pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a CSV/TSV export, or a directory of them.
    Ingest {
        /// A single export file.
        #[arg(long, conflicts_with = "dir")]
        file: Option<PathBuf>,
        /// A directory of exports, ingested in name order.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// incremental (default) or clear.
        #[arg(long, default_value = "incremental")]
        mode: IngestMode,
        /// Parse and resolve only; write nothing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Refresh the company/prospect materialized view once.
    Refresh,
    /// Run the CDC relay loop into the search index.
    Relay,
    /// Serve the HTTP trigger API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Print row counts and the CDC checkpoint.
    Status,
    /// Probe the database, cache and search index.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Ingest {
            file,
            dir,
            mode,
            dry_run,
        } => {
            if dry_run {
                let Some(file) = file else {
                    bail!("--dry-run requires --file");
                };
                let report = leadflow_sync::dry_run_file(&file, config.thresholds)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            let pipeline = IngestPipeline::connect(config).await?;
            let summaries = match (file, dir) {
                (Some(file), None) => vec![pipeline.ingest_file(&file, mode).await?],
                (None, Some(dir)) => pipeline.ingest_dir(&dir, mode).await?,
                _ => bail!("exactly one of --file or --dir is required"),
            };
            for summary in &summaries {
                println!(
                    "{}: {} rows, {} rejected, {} companies, {} prospects ({:?})",
                    summary.file,
                    summary.rows_read,
                    summary.rows_rejected,
                    summary.companies_written,
                    summary.prospects_written,
                    summary.strategy
                );
            }
        }
        Commands::Refresh => {
            let pipeline = IngestPipeline::connect(config).await?;
            let outcome = pipeline.refresher().run_once().await?;
            println!("refresh: {outcome:?}");
        }
        Commands::Relay => {
            let pool = leadflow_storage::connect_pool(&config.database_url).await?;
            let cache = CacheStore::connect(&config.redis_url, "leadflow").await?;
            let search = SearchIndexClient::new(
                &config.search_url,
                &config.search_index,
                BackoffPolicy::default(),
            )?;
            CdcRelay::new(pool, cache, search, &config).run().await?;
        }
        Commands::Serve { port } => {
            let pipeline = Arc::new(IngestPipeline::connect(config).await?);
            leadflow_api::serve(pipeline, port).await?;
        }
        Commands::Status => {
            let pipeline = IngestPipeline::connect(config).await?;
            let status = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Health => {
            let pipeline = IngestPipeline::connect(config).await?;
            let report = pipeline.health().await;
            println!(
                "status={} database={} cache={} search={}",
                report.status(),
                report.database,
                report.cache,
                report.search
            );
            if !report.is_ok() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
