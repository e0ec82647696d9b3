use std::path::PathBuf;

use anyhow::{Context, Result};
use cashtrack_core::{HistoryQuery, StatisticsQuery};
use cashtrack_storage::HistoryStore;
use cashtrack_sync::{IngestOutcome, IngestService, SyncConfig};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cashtrack")]
#[command(about = "Cashback rate tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract and record rates from one already-acquired page.
    Ingest {
        #[arg(long)]
        url: String,
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
    },
    /// Ingest every enabled merchant in merchants.yaml.
    Sync,
    History {
        #[arg(long)]
        merchant: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    Stats {
        #[arg(long)]
        merchant: Option<String>,
        #[arg(long)]
        category: Option<String>,
    },
    Merchants,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Ingest { url, file } => {
            let markup = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let service = IngestService::connect(&config).await?;
            match service.ingest_markup(&url, &markup).await? {
                IngestOutcome::Recorded { receipt, degraded, .. } => println!(
                    "recorded: merchant_id={} observations={} degraded={}",
                    receipt.merchant_id, receipt.observations, degraded
                ),
                IngestOutcome::Captured { fallback, error, .. } => println!(
                    "not recorded ({error}); captured to {}",
                    fallback.absolute_path.display()
                ),
            }
        }
        Commands::Sync => {
            let summary = cashtrack_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} merchants={} recorded={} degraded={} failed={} captured={}",
                summary.run_id,
                summary.enabled_merchants,
                summary.recorded,
                summary.degraded,
                summary.failed,
                summary.captured
            );
        }
        Commands::History {
            merchant,
            url,
            category,
            limit,
        } => {
            let store = open_store(&config).await?;
            let rows = store
                .history(&HistoryQuery {
                    merchant,
                    url,
                    category,
                    limit,
                })
                .await?;
            print_json(&rows)?;
        }
        Commands::Stats { merchant, category } => {
            let store = open_store(&config).await?;
            let rows = store
                .statistics(&StatisticsQuery { merchant, category })
                .await?;
            print_json(&rows)?;
        }
        Commands::Merchants => {
            let store = open_store(&config).await?;
            print_json(&store.merchants().await?)?;
        }
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<HistoryStore> {
    let store = HistoryStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{text}");
    Ok(())
}
