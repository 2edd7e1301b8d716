use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::SyncContext;

/// Cron jobs for both runs, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(ctx: Arc<SyncContext>) -> Result<Option<JobScheduler>> {
    if !ctx.config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(ctx).await.map(Some)
}

pub async fn build_scheduler(ctx: Arc<SyncContext>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let ingest_cron = ctx.config.ingest_cron.clone();
    let ingest_ctx = Arc::clone(&ctx);
    let ingest = Job::new_async(ingest_cron.as_str(), move |_uuid, _l| {
        let ctx = Arc::clone(&ingest_ctx);
        Box::pin(async move {
            match ctx.run_ingestion().await {
                Ok(Some(summary)) => info!(run_id = %summary.run_id, "scheduled ingestion finished"),
                Ok(None) => info!("scheduled ingestion skipped; previous run still in progress"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating ingestion job for cron {ingest_cron}"))?;
    sched.add(ingest).await.context("adding ingestion job")?;

    let export_cron = ctx.config.export_cron.clone();
    let export_ctx = Arc::clone(&ctx);
    let export = Job::new_async(export_cron.as_str(), move |_uuid, _l| {
        let ctx = Arc::clone(&export_ctx);
        Box::pin(async move {
            match ctx.run_enrichment_export().await {
                Ok(Some(summary)) => info!(run_id = %summary.run_id, "scheduled export finished"),
                Ok(None) => info!("scheduled export skipped; previous run still in progress"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled export failed"),
            }
        })
    })
    .with_context(|| format!("creating export job for cron {export_cron}"))?;
    sched.add(export).await.context("adding export job")?;

    info!(
        ingest_cron = %ingest_cron,
        export_cron = %export_cron,
        "scheduler configured"
    );
    Ok(sched)
}
