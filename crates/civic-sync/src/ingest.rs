//! Ingestion Orchestrator: fetch a page, write it, then advance the checkpoint.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use civic_adapters::{IssuePageSource, IssueQuery, PaginatedFetcher};
use civic_storage::{render_checkpoint, CheckpointStore, FetchError, IssueStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::writer::{write_batch, BatchReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionState {
    Idle,
    Fetching,
    Writing,
    CheckpointAdvance,
    Failed,
}

impl fmt::Display for IngestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Writing => "writing",
            Self::CheckpointAdvance => "checkpoint_advance",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Fatal for the current run. The checkpoint keeps the value of the last
/// page that was fully written.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetching issues: {0}")]
    Fetch(#[from] FetchError),
    #[error("issue store: {0}")]
    Storage(#[from] StoreError),
    #[error("ingestion run exceeded its {0:?} budget")]
    Timeout(Duration),
    #[error("pagination did not end within {0} pages")]
    PageLimit(u32),
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Checkpoint key.
    pub source_name: String,
    pub place_url: String,
    pub per_page: u32,
    pub statuses: Vec<String>,
    /// Lower bound used when the source has no checkpoint yet.
    pub default_updated_at: DateTime<Utc>,
    pub created_at_after: Option<DateTime<Utc>>,
    pub run_timeout: Duration,
    pub max_pages: u32,
}

impl IngestOptions {
    pub fn new(
        source_name: impl Into<String>,
        place_url: impl Into<String>,
        default_updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            place_url: place_url.into(),
            per_page: 20,
            statuses: civic_adapters::DEFAULT_STATUSES
                .iter()
                .map(ToString::to_string)
                .collect(),
            default_updated_at,
            created_at_after: None,
            run_timeout: Duration::from_secs(3600),
            max_pages: 10_000,
        }
    }

    fn query(&self, updated_at_after: DateTime<Utc>) -> IssueQuery {
        IssueQuery {
            place_url: self.place_url.clone(),
            updated_at_after,
            created_at_after: self.created_at_after,
            statuses: self.statuses.clone(),
            per_page: self.per_page,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub run_id: Uuid,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub records_received: usize,
    pub records_written: usize,
    pub records_inserted: usize,
    pub records_updated: usize,
    pub records_stale: usize,
    pub records_skipped_malformed: usize,
    pub checkpoint_before: Option<DateTime<Utc>>,
    pub checkpoint_after: Option<DateTime<Utc>>,
}

impl IngestionSummary {
    fn new(run_id: Uuid, source_name: &str, checkpoint_before: Option<DateTime<Utc>>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            source_name: source_name.to_string(),
            started_at: now,
            finished_at: now,
            pages_fetched: 0,
            records_received: 0,
            records_written: 0,
            records_inserted: 0,
            records_updated: 0,
            records_stale: 0,
            records_skipped_malformed: 0,
            checkpoint_before,
            checkpoint_after: checkpoint_before,
        }
    }

    fn absorb(&mut self, batch: &BatchReport) {
        self.records_received += batch.received;
        self.records_written += batch.written();
        self.records_inserted += batch.inserted;
        self.records_updated += batch.updated;
        self.records_stale += batch.stale;
        self.records_skipped_malformed += batch.malformed;
    }
}

/// One ingestion run against one issue source.
///
/// Every non-empty page is a write batch; the checkpoint moves to that
/// batch's newest `updated_at` only after the batch is written, and the walk
/// then restarts at page 1 from the new checkpoint. The source's lower bound
/// is inclusive, so rows at the boundary are received again and absorbed by
/// the upserting store, as are the rows refetched after a crash.
pub struct Ingestor {
    source: Arc<dyn IssuePageSource>,
    issues: Arc<dyn IssueStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    options: IngestOptions,
    state: IngestionState,
}

impl Ingestor {
    pub fn new(
        source: Arc<dyn IssuePageSource>,
        issues: Arc<dyn IssueStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: IngestOptions,
    ) -> Self {
        Self {
            source,
            issues,
            checkpoints,
            options,
            state: IngestionState::Idle,
        }
    }

    pub fn state(&self) -> IngestionState {
        self.state
    }

    pub async fn run(&mut self) -> Result<IngestionSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let budget = self.options.run_timeout;
        let result = match tokio::time::timeout(budget, self.run_pages(run_id)).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::Timeout(budget)),
        };

        match result {
            Ok(mut summary) => {
                self.transition(IngestionState::Idle);
                summary.finished_at = Utc::now();
                info!(
                    run_id = %summary.run_id,
                    source = %summary.source_name,
                    pages_fetched = summary.pages_fetched,
                    records_received = summary.records_received,
                    records_written = summary.records_written,
                    records_stale = summary.records_stale,
                    records_skipped_malformed = summary.records_skipped_malformed,
                    checkpoint_before = %summary.checkpoint_before.map(render_checkpoint).unwrap_or_default(),
                    checkpoint_after = %summary.checkpoint_after.map(render_checkpoint).unwrap_or_default(),
                    "ingestion run complete"
                );
                Ok(summary)
            }
            Err(err) => {
                let failed_in = self.state;
                self.transition(IngestionState::Failed);
                error!(%run_id, state = %failed_in, error = %err, "ingestion run failed");
                Err(err)
            }
        }
    }

    async fn run_pages(&mut self, run_id: Uuid) -> Result<IngestionSummary, IngestError> {
        let source_name = self.options.source_name.clone();
        let stored = self.checkpoints.load(&source_name).await?;
        let updated_at_after = stored.unwrap_or(self.options.default_updated_at);
        info!(
            %run_id,
            source = %source_name,
            updated_at_after = %render_checkpoint(updated_at_after),
            resumed = stored.is_some(),
            "starting ingestion run"
        );

        let mut summary = IngestionSummary::new(run_id, &source_name, stored);
        let source = Arc::clone(&self.source);
        let mut fetcher =
            PaginatedFetcher::new(source.as_ref(), run_id, self.options.query(updated_at_after));

        loop {
            if fetcher.pages_fetched() >= self.options.max_pages {
                return Err(IngestError::PageLimit(self.options.max_pages));
            }

            self.transition(IngestionState::Fetching);
            let batch = fetcher.next_batch().await;
            summary.pages_fetched = fetcher.pages_fetched();
            let Some(batch) = batch? else {
                break;
            };

            self.transition(IngestionState::Writing);
            let report = write_batch(self.issues.as_ref(), &batch.issues).await?;
            summary.absorb(&report);
            info!(
                %run_id,
                page = batch.page,
                inserted = report.inserted,
                updated = report.updated,
                stale = report.stale,
                malformed = report.malformed,
                "page written"
            );

            if let Some(seen) = report.max_updated_at {
                self.transition(IngestionState::CheckpointAdvance);
                let held = self.checkpoints.advance(&source_name, seen).await?;
                summary.checkpoint_after = Some(held);
                // Keyset paging: the next request starts from what is now
                // durable. A page that did not move the bound (all rows tied
                // at it) falls through to the next page number instead.
                if held > fetcher.query().updated_at_after {
                    fetcher.restart_after(held);
                }
            }
        }

        Ok(summary)
    }

    fn transition(&mut self, next: IngestionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "ingestion state");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use civic_adapters::{FetchedIssuePage, IssuePage, PageMetadata, Pagination};
    use civic_storage::{MemoryCheckpointStore, MemoryIssueStore};
    use serde_json::json;

    /// Serves the same non-empty page forever.
    struct EndlessSource;

    #[async_trait]
    impl IssuePageSource for EndlessSource {
        async fn fetch_page(
            &self,
            _run_id: Uuid,
            _query: &IssueQuery,
            page: u32,
        ) -> Result<FetchedIssuePage, FetchError> {
            Ok(FetchedIssuePage {
                page: IssuePage {
                    issues: vec![json!({
                        "id": page,
                        "status": "Open",
                        "created_at": "2024-01-01T00:00:00Z",
                        "updated_at": "2024-01-02T00:00:00Z"
                    })],
                    metadata: PageMetadata {
                        pagination: Pagination {
                            next_page: Some(page + 1),
                            ..Default::default()
                        },
                    },
                },
                rate_limit_remaining: None,
                elapsed: Duration::ZERO,
            })
        }
    }

    /// Never answers.
    struct HangingSource;

    #[async_trait]
    impl IssuePageSource for HangingSource {
        async fn fetch_page(
            &self,
            _run_id: Uuid,
            _query: &IssueQuery,
            _page: u32,
        ) -> Result<FetchedIssuePage, FetchError> {
            std::future::pending().await
        }
    }

    fn options() -> IngestOptions {
        IngestOptions::new(
            "test_source",
            "tacoma",
            Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).single().unwrap(),
        )
    }

    #[tokio::test]
    async fn non_terminating_pagination_hits_the_page_limit() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut opts = options();
        opts.max_pages = 3;
        let mut ingestor = Ingestor::new(
            Arc::new(EndlessSource),
            Arc::new(MemoryIssueStore::new()),
            checkpoints.clone(),
            opts,
        );

        let err = ingestor.run().await.unwrap_err();

        assert!(matches!(err, IngestError::PageLimit(3)));
        assert_eq!(ingestor.state(), IngestionState::Failed);
        // Pages that were written before the limit still moved the checkpoint.
        assert!(checkpoints.load("test_source").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_fails_without_touching_the_checkpoint() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut opts = options();
        opts.run_timeout = Duration::from_secs(5);
        let mut ingestor = Ingestor::new(
            Arc::new(HangingSource),
            Arc::new(MemoryIssueStore::new()),
            checkpoints.clone(),
            opts,
        );

        let err = ingestor.run().await.unwrap_err();

        assert!(matches!(err, IngestError::Timeout(_)));
        assert_eq!(checkpoints.load("test_source").await.unwrap(), None);
    }

    #[test]
    fn query_carries_the_checkpoint_and_filters() {
        let mut opts = options();
        opts.created_at_after = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).single();
        let after = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).single().unwrap();
        let params = opts.query(after).params(1);

        assert!(params.contains(&("updated_at_after".into(), "2024-05-06T07:08:09Z".into())));
        assert!(params.contains(&("after".into(), "2023-01-01T00:00:00Z".into())));
        assert!(params.contains(&("sort_direction".into(), "ASC".into())));
    }
}
