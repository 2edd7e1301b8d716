//! Ingestion and enrichment/export runs, plus the wiring that feeds them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use civic_adapters::{IssuePageSource, SeeClickFixSource};
use civic_geo::{GeoLayer, SpatialEnricher};
use civic_storage::{
    connect_and_migrate, CheckpointStore, HttpFetcher, IssueStore, PgCheckpointStore, PgIssueStore,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub mod config;
pub mod export;
pub mod ingest;
pub mod scheduler;
pub mod writer;

pub use config::{load_layers_from_registry, LayerConfig, LayerRegistry, SyncConfig};
pub use export::{write_snapshot, SnapshotManifest, SnapshotPaths};
pub use ingest::{IngestError, IngestOptions, IngestionState, IngestionSummary, Ingestor};
pub use scheduler::{build_scheduler, maybe_build_scheduler};
pub use writer::{write_batch, BatchReport};

pub const CRATE_NAME: &str = "civic-sync";

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub records_located: usize,
    pub records_skipped_no_coordinates: usize,
    pub within_shelter_buffer: usize,
    pub layers: usize,
    pub zones: usize,
    pub snapshot_path: String,
    pub manifest_path: String,
}

/// Stores, source and settings shared by every run in a process.
///
/// Each run kind holds its own lock, so a scheduled run that fires while the
/// previous one is still going is skipped rather than stacked. A skipped run
/// returns `Ok(None)`.
pub struct SyncContext {
    pub config: SyncConfig,
    issues: Arc<dyn IssueStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    source: Arc<dyn IssuePageSource>,
    ingest_lock: Mutex<()>,
    export_lock: Mutex<()>,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        issues: Arc<dyn IssueStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        source: Arc<dyn IssuePageSource>,
    ) -> Self {
        Self {
            config,
            issues,
            checkpoints,
            source,
            ingest_lock: Mutex::new(()),
            export_lock: Mutex::new(()),
        }
    }

    /// Postgres-backed stores and the live issue API.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let pool = connect_and_migrate(&config.database_url).await?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let source = SeeClickFixSource::new(http, config.api_base_url.clone());
        Ok(Self::new(
            config,
            Arc::new(PgIssueStore::new(pool.clone())),
            Arc::new(PgCheckpointStore::new(pool)),
            Arc::new(source),
        ))
    }

    pub fn issues(&self) -> &Arc<dyn IssueStore> {
        &self.issues
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub async fn run_ingestion(&self) -> Result<Option<IngestionSummary>> {
        let Ok(_guard) = self.ingest_lock.try_lock() else {
            info!("ingestion already running; skipping");
            return Ok(None);
        };
        let mut ingestor = Ingestor::new(
            Arc::clone(&self.source),
            Arc::clone(&self.issues),
            Arc::clone(&self.checkpoints),
            self.config.ingest_options(),
        );
        Ok(Some(ingestor.run().await?))
    }

    pub async fn run_enrichment_export(&self) -> Result<Option<EnrichmentRunSummary>> {
        let Ok(_guard) = self.export_lock.try_lock() else {
            info!("enrichment export already running; skipping");
            return Ok(None);
        };
        let layers = load_layers_from_registry(&self.config.layers_file).await?;
        run_enrichment_export(self.issues.as_ref(), layers, &self.config.exports_dir)
            .await
            .map(Some)
    }
}

/// Join every stored issue against `layers` and replace the snapshot in
/// `exports_dir`.
pub async fn run_enrichment_export(
    issues: &dyn IssueStore,
    layers: Vec<GeoLayer>,
    exports_dir: &Path,
) -> Result<EnrichmentRunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let records = issues.load_all().await.context("loading issues for enrichment")?;
    let layer_count = layers.len();
    let enricher = SpatialEnricher::new(layers);
    let output = enricher.enrich(records);

    let paths = export::write_snapshot(exports_dir, run_id, &output.issues, &output.zones).await?;

    let summary = EnrichmentRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        records: output.report.total_records,
        records_located: output.report.located_records,
        records_skipped_no_coordinates: output.report.skipped_no_coordinates,
        within_shelter_buffer: output.report.within_shelter_buffer,
        layers: layer_count,
        zones: output.zones.len(),
        snapshot_path: paths.issues.display().to_string(),
        manifest_path: paths.manifest.display().to_string(),
    };
    info!(
        %run_id,
        records = summary.records,
        located = summary.records_located,
        skipped_no_coordinates = summary.records_skipped_no_coordinates,
        zones = summary.zones,
        snapshot = %summary.snapshot_path,
        "enrichment export complete"
    );
    Ok(summary)
}

pub async fn run_ingestion_from_env() -> Result<IngestionSummary> {
    let ctx = SyncContext::connect(SyncConfig::from_env()).await?;
    ctx.run_ingestion()
        .await?
        .context("ingestion already running in this process")
}

pub async fn run_enrichment_export_from_env() -> Result<EnrichmentRunSummary> {
    let ctx = SyncContext::connect(SyncConfig::from_env()).await?;
    ctx.run_enrichment_export()
        .await?
        .context("enrichment export already running in this process")
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    connect_and_migrate(&config.database_url).await?;
    info!("migrations applied");
    Ok(())
}
