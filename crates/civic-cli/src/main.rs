use std::sync::Arc;

use anyhow::{Context, Result};
use civic_sync::{maybe_build_scheduler, SyncConfig, SyncContext};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "civic-cli")]
#[command(about = "Civic 311 ingestion and geo-enrichment pipeline")]
struct Cli {
    /// Print run summaries as JSON instead of a one-line report.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull new and updated issues since the checkpoint.
    Ingest,
    /// Join stored issues against the geo layers and write the snapshot.
    Enrich,
    /// Apply database migrations.
    Migrate,
    /// Run both jobs on their cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = civic_sync::run_ingestion_from_env().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "ingest complete: run_id={} pages={} written={} malformed={} checkpoint={}",
                    summary.run_id,
                    summary.pages_fetched,
                    summary.records_written,
                    summary.records_skipped_malformed,
                    summary
                        .checkpoint_after
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "none".to_string())
                );
            }
        }
        Commands::Enrich => {
            let summary = civic_sync::run_enrichment_export_from_env().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "enrich complete: run_id={} records={} located={} no_coordinates={} snapshot={}",
                    summary.run_id,
                    summary.records,
                    summary.records_located,
                    summary.records_skipped_no_coordinates,
                    summary.snapshot_path
                );
            }
        }
        Commands::Migrate => {
            civic_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let ctx = Arc::new(SyncContext::connect(SyncConfig::from_env()).await?);
            let Some(mut sched) = maybe_build_scheduler(ctx).await? else {
                eprintln!("scheduler disabled; set CIVIC_SCHEDULER_ENABLED=true to enable it");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
