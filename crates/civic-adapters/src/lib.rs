//! Issue-source API client and the page walker built on top of it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civic_storage::{render_checkpoint, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "civic-adapters";

pub const DEFAULT_STATUSES: &[&str] = &["archived", "open", "acknowledged", "closed"];

/// Filter and sort for one walk over the issue endpoint. The page number is
/// supplied per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueQuery {
    pub place_url: String,
    pub updated_at_after: DateTime<Utc>,
    pub created_at_after: Option<DateTime<Utc>>,
    pub statuses: Vec<String>,
    pub per_page: u32,
}

impl IssueQuery {
    pub fn new(place_url: impl Into<String>, updated_at_after: DateTime<Utc>) -> Self {
        Self {
            place_url: place_url.into(),
            updated_at_after,
            created_at_after: None,
            statuses: DEFAULT_STATUSES.iter().map(ToString::to_string).collect(),
            per_page: 20,
        }
    }

    pub fn params(&self, page: u32) -> Vec<(String, String)> {
        let mut params = vec![
            ("place_url".to_string(), self.place_url.clone()),
            ("details".to_string(), "true".to_string()),
            (
                "updated_at_after".to_string(),
                render_checkpoint(self.updated_at_after),
            ),
            ("sort".to_string(), "updated_at".to_string()),
            ("sort_direction".to_string(), "ASC".to_string()),
            ("page".to_string(), page.to_string()),
            ("per_page".to_string(), self.per_page.to_string()),
        ];
        if !self.statuses.is_empty() {
            params.push(("status".to_string(), self.statuses.join(",")));
        }
        if let Some(after) = self.created_at_after {
            params.push(("after".to_string(), render_checkpoint(after)));
        }
        params
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssuePage {
    pub issues: Vec<JsonValue>,
    #[serde(default)]
    pub metadata: PageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub entries: Option<u64>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub pages: Option<u32>,
    pub next_page: Option<u32>,
}

impl IssuePage {
    /// The page to request after `current`, or `None` when the walk is over.
    ///
    /// An empty page or a missing `next_page` marker both end the walk.
    pub fn next_page_after(&self, current: u32) -> Option<u32> {
        if self.issues.is_empty() {
            return None;
        }
        match self.metadata.pagination.next_page {
            Some(next) if next > current => Some(next),
            Some(next) => {
                warn!(current, next, "non-advancing next_page marker; stopping pagination");
                None
            }
            None => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedIssuePage {
    pub page: IssuePage,
    pub rate_limit_remaining: Option<String>,
    pub elapsed: Duration,
}

#[async_trait]
pub trait IssuePageSource: Send + Sync {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        query: &IssueQuery,
        page: u32,
    ) -> Result<FetchedIssuePage, FetchError>;
}

/// SeeClickFix-style `/issues` endpoint.
#[derive(Debug)]
pub struct SeeClickFixSource {
    http: HttpFetcher,
    base_url: String,
}

impl SeeClickFixSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl IssuePageSource for SeeClickFixSource {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        query: &IssueQuery,
        page: u32,
    ) -> Result<FetchedIssuePage, FetchError> {
        let (page, response) = self
            .http
            .get_json::<IssuePage>(run_id, &self.base_url, &query.params(page))
            .await?;
        Ok(FetchedIssuePage {
            page,
            rate_limit_remaining: response.rate_limit_remaining,
            elapsed: response.elapsed,
        })
    }
}

/// One non-empty page of raw issue payloads.
#[derive(Debug, Clone)]
pub struct IssueBatch {
    pub page: u32,
    pub issues: Vec<JsonValue>,
    pub total_entries: Option<u64>,
}

/// Walks pages of an [`IssuePageSource`] in order, one request at a time.
///
/// The walk is finite and restartable: building a new fetcher with the same
/// `updated_at_after` replays it from page 1, and [`restart_after`] moves an
/// existing walk to a later lower bound.
///
/// [`restart_after`]: PaginatedFetcher::restart_after
pub struct PaginatedFetcher<'a, S: IssuePageSource + ?Sized> {
    source: &'a S,
    query: IssueQuery,
    run_id: Uuid,
    next_page: Option<u32>,
    pages_fetched: u32,
}

impl<'a, S: IssuePageSource + ?Sized> PaginatedFetcher<'a, S> {
    pub fn new(source: &'a S, run_id: Uuid, query: IssueQuery) -> Self {
        Self {
            source,
            query,
            run_id,
            next_page: Some(1),
            pages_fetched: 0,
        }
    }

    pub fn query(&self) -> &IssueQuery {
        &self.query
    }

    /// Requests issued so far, including the terminating empty page.
    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_page.is_none()
    }

    /// Start again at page 1 with `updated_at_after` as the lower bound.
    ///
    /// Rows updated while a walk is in flight move to the tail of the sorted
    /// result set and shift every later row back; re-querying from the last
    /// committed timestamp keeps those rows from falling between two pages.
    /// An exhausted walk stays exhausted.
    pub fn restart_after(&mut self, updated_at_after: DateTime<Utc>) {
        if self.next_page.is_none() {
            return;
        }
        debug!(
            run_id = %self.run_id,
            updated_at_after = %render_checkpoint(updated_at_after),
            "restarting pagination from new lower bound"
        );
        self.query.updated_at_after = updated_at_after;
        self.next_page = Some(1);
    }

    /// Fetch the next page. `Ok(None)` means no more data.
    pub async fn next_batch(&mut self) -> Result<Option<IssueBatch>, FetchError> {
        let Some(page_no) = self.next_page else {
            return Ok(None);
        };

        let fetched = match self.source.fetch_page(self.run_id, &self.query, page_no).await {
            Ok(fetched) => fetched,
            Err(err) => {
                self.next_page = None;
                return Err(err);
            }
        };
        self.pages_fetched += 1;

        let total_entries = fetched.page.metadata.pagination.entries;
        info!(
            run_id = %self.run_id,
            page = page_no,
            issues = fetched.page.issues.len(),
            total_entries = total_entries.unwrap_or(0),
            rate_limit_remaining = fetched.rate_limit_remaining.as_deref().unwrap_or("unknown"),
            elapsed_ms = fetched.elapsed.as_millis() as u64,
            "fetched issue page"
        );

        self.next_page = fetched.page.next_page_after(page_no);
        if fetched.page.issues.is_empty() {
            info!(run_id = %self.run_id, page = page_no, "empty page; stopping pagination");
            return Ok(None);
        }

        Ok(Some(IssueBatch {
            page: page_no,
            issues: fetched.page.issues,
            total_entries,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tokio::sync::Mutex;

    struct FakeSource {
        pages: Vec<IssuePage>,
        requested: Mutex<Vec<u32>>,
        fail_on: Option<u32>,
    }

    impl FakeSource {
        fn new(pages: Vec<IssuePage>) -> Self {
            Self {
                pages,
                requested: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl IssuePageSource for FakeSource {
        async fn fetch_page(
            &self,
            _run_id: Uuid,
            _query: &IssueQuery,
            page: u32,
        ) -> Result<FetchedIssuePage, FetchError> {
            self.requested.lock().await.push(page);
            if self.fail_on == Some(page) {
                return Err(FetchError::HttpStatus {
                    status: 503,
                    url: "fake".into(),
                    body: "down".into(),
                });
            }
            let page = self
                .pages
                .get(page as usize - 1)
                .cloned()
                .unwrap_or_default();
            Ok(FetchedIssuePage {
                page,
                rate_limit_remaining: Some("19".into()),
                elapsed: Duration::from_millis(3),
            })
        }
    }

    fn page(ids: std::ops::Range<i64>, next_page: Option<u32>) -> IssuePage {
        IssuePage {
            issues: ids.map(|id| json!({ "id": id })).collect(),
            metadata: PageMetadata {
                pagination: Pagination {
                    entries: Some(20),
                    next_page,
                    ..Default::default()
                },
            },
        }
    }

    fn query() -> IssueQuery {
        IssueQuery::new("tacoma", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap())
    }

    async fn drain(fetcher: &mut PaginatedFetcher<'_, FakeSource>) -> Vec<IssueBatch> {
        let mut out = Vec::new();
        while let Some(batch) = fetcher.next_batch().await.expect("page") {
            out.push(batch);
        }
        out
    }

    #[tokio::test]
    async fn empty_second_page_terminates_after_twenty_records() {
        let source = FakeSource::new(vec![page(0..20, Some(2)), page(0..0, Some(3))]);
        let mut fetcher = PaginatedFetcher::new(&source, Uuid::new_v4(), query());

        let batches = drain(&mut fetcher).await;

        assert_eq!(batches.len(), 1);
        assert_eq!(batches.iter().map(|b| b.issues.len()).sum::<usize>(), 20);
        assert_eq!(*source.requested.lock().await, vec![1, 2]);
        assert_eq!(fetcher.pages_fetched(), 2);
        assert!(fetcher.is_exhausted());
    }

    #[tokio::test]
    async fn missing_next_page_marker_terminates_without_extra_request() {
        let source = FakeSource::new(vec![page(0..20, Some(2)), page(20..25, None)]);
        let mut fetcher = PaginatedFetcher::new(&source, Uuid::new_v4(), query());

        let batches = drain(&mut fetcher).await;

        assert_eq!(batches.iter().map(|b| b.issues.len()).sum::<usize>(), 25);
        assert_eq!(batches[1].page, 2);
        assert_eq!(*source.requested.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn non_advancing_marker_stops() {
        let source = FakeSource::new(vec![page(0..5, Some(1))]);
        let mut fetcher = PaginatedFetcher::new(&source, Uuid::new_v4(), query());
        assert_eq!(drain(&mut fetcher).await.len(), 1);
        assert_eq!(*source.requested.lock().await, vec![1]);
    }

    #[tokio::test]
    async fn errors_surface_and_end_the_walk() {
        let mut source = FakeSource::new(vec![page(0..20, Some(2)), page(20..40, Some(3))]);
        source.fail_on = Some(2);
        let mut fetcher = PaginatedFetcher::new(&source, Uuid::new_v4(), query());

        assert!(fetcher.next_batch().await.expect("page 1").is_some());
        assert!(fetcher.next_batch().await.is_err());
        assert!(fetcher.next_batch().await.expect("after error").is_none());
    }

    #[test]
    fn query_params_carry_checkpoint_and_sort() {
        let mut q = query();
        q.created_at_after = Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).single().unwrap());
        let params = q.params(3);
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("updated_at_after"), Some("2024-01-01T00:00:00Z"));
        assert_eq!(get("sort"), Some("updated_at"));
        assert_eq!(get("sort_direction"), Some("ASC"));
        assert_eq!(get("page"), Some("3"));
        assert_eq!(get("per_page"), Some("20"));
        assert_eq!(get("status"), Some("archived,open,acknowledged,closed"));
        assert_eq!(get("after"), Some("2023-01-01T00:00:00Z"));
    }

    #[test]
    fn decodes_api_envelope() {
        let page: IssuePage = serde_json::from_value(json!({
            "issues": [{"id": 1}, {"id": 2}],
            "metadata": {"pagination": {"entries": 42, "page": 1, "per_page": 20, "pages": 3, "next_page": 2, "next_page_url": "x"}}
        }))
        .expect("decode");
        assert_eq!(page.issues.len(), 2);
        assert_eq!(page.metadata.pagination.entries, Some(42));
        assert_eq!(page.next_page_after(1), Some(2));

        let bare: IssuePage = serde_json::from_value(json!({"issues": []})).expect("decode");
        assert_eq!(bare.next_page_after(1), None);
    }

    #[test]
    fn envelope_without_issues_is_a_decode_error() {
        let err = serde_json::from_value::<IssuePage>(json!({"errors": {"place_url": "unknown"}}));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn restart_moves_the_bound_and_returns_to_page_one() {
        let source = FakeSource::new(vec![page(0..20, Some(2)), page(20..40, Some(3))]);
        let mut fetcher = PaginatedFetcher::new(&source, Uuid::new_v4(), query());
        fetcher.next_batch().await.expect("page 1");

        let later = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).single().unwrap();
        fetcher.restart_after(later);
        let batch = fetcher.next_batch().await.expect("restarted").expect("batch");

        assert_eq!(batch.page, 1);
        assert_eq!(fetcher.query().updated_at_after, later);
        assert_eq!(fetcher.pages_fetched(), 2);
        assert_eq!(*source.requested.lock().await, vec![1, 1]);
    }

    #[tokio::test]
    async fn restart_does_not_revive_an_exhausted_walk() {
        let source = FakeSource::new(vec![page(0..5, None)]);
        let mut fetcher = PaginatedFetcher::new(&source, Uuid::new_v4(), query());
        fetcher.next_batch().await.expect("page 1");
        assert!(fetcher.is_exhausted());

        fetcher.restart_after(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).single().unwrap());

        assert!(fetcher.next_batch().await.expect("done").is_none());
        assert_eq!(*source.requested.lock().await, vec![1]);
    }
}
