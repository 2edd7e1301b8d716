//! Upsertable issue table keyed by the source's external id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civic_core::{IssueRecord, IssueStatus, Person, RequestType};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored row carries a later `updated_at`; nothing was written.
    Stale,
}

/// Insert-or-update store for [`IssueRecord`]s.
///
/// On conflict every mutable field is overwritten, except when the incoming
/// `updated_at` is older than the stored one. `external_id` and `created_at`
/// are never changed by an update.
#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn upsert(&self, record: &IssueRecord) -> Result<UpsertOutcome, StoreError>;

    /// Every stored issue ordered by external id.
    async fn load_all(&self) -> Result<Vec<IssueRecord>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryIssueStore {
    rows: Mutex<BTreeMap<i64, IssueRecord>>,
}

impl MemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, external_id: i64) -> Option<IssueRecord> {
        self.rows.lock().await.get(&external_id).cloned()
    }
}

#[async_trait]
impl IssueStore for MemoryIssueStore {
    async fn upsert(&self, record: &IssueRecord) -> Result<UpsertOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&record.external_id) {
            None => {
                rows.insert(record.external_id, record.clone());
                Ok(UpsertOutcome::Inserted)
            }
            Some(existing) if record.updated_at < existing.updated_at => Ok(UpsertOutcome::Stale),
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = record.clone();
                existing.created_at = created_at;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn load_all(&self) -> Result<Vec<IssueRecord>, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.lock().await.len() as u64)
    }
}

#[derive(Debug, Clone)]
pub struct PgIssueStore {
    pool: PgPool,
}

const UPSERT_SQL: &str = r#"
INSERT INTO issues (
    external_id, summary, description, status, created_at, updated_at,
    acknowledged_at, closed_at, lat, lng, address, html_url, url, comment_url,
    shortened_url, rating, vote_count, comment_count,
    assignee_id, assignee_name, assignee_role,
    reporter_id, reporter_name, reporter_role,
    request_type_id, request_type_title, request_type_organization, ingested_at
)
VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, now()
)
ON CONFLICT (external_id) DO UPDATE SET
    summary = EXCLUDED.summary,
    description = EXCLUDED.description,
    status = EXCLUDED.status,
    updated_at = EXCLUDED.updated_at,
    acknowledged_at = EXCLUDED.acknowledged_at,
    closed_at = EXCLUDED.closed_at,
    lat = EXCLUDED.lat,
    lng = EXCLUDED.lng,
    address = EXCLUDED.address,
    html_url = EXCLUDED.html_url,
    url = EXCLUDED.url,
    comment_url = EXCLUDED.comment_url,
    shortened_url = EXCLUDED.shortened_url,
    rating = EXCLUDED.rating,
    vote_count = EXCLUDED.vote_count,
    comment_count = EXCLUDED.comment_count,
    assignee_id = EXCLUDED.assignee_id,
    assignee_name = EXCLUDED.assignee_name,
    assignee_role = EXCLUDED.assignee_role,
    reporter_id = EXCLUDED.reporter_id,
    reporter_name = EXCLUDED.reporter_name,
    reporter_role = EXCLUDED.reporter_role,
    request_type_id = EXCLUDED.request_type_id,
    request_type_title = EXCLUDED.request_type_title,
    request_type_organization = EXCLUDED.request_type_organization,
    ingested_at = now()
WHERE issues.updated_at <= EXCLUDED.updated_at
RETURNING (xmax = 0) AS inserted
"#;

const SELECT_ALL_SQL: &str = r#"
SELECT external_id, summary, description, status, created_at, updated_at,
       acknowledged_at, closed_at, lat, lng, address, html_url, url, comment_url,
       shortened_url, rating, vote_count, comment_count,
       assignee_id, assignee_name, assignee_role,
       reporter_id, reporter_name, reporter_role,
       request_type_id, request_type_title, request_type_organization
FROM issues
ORDER BY external_id
"#;

impl PgIssueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl IssueStore for PgIssueStore {
    async fn upsert(&self, record: &IssueRecord) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(UPSERT_SQL)
            .bind(record.external_id)
            .bind(&record.summary)
            .bind(&record.description)
            .bind(record.status.as_str())
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.acknowledged_at)
            .bind(record.closed_at)
            .bind(record.lat)
            .bind(record.lng)
            .bind(&record.address)
            .bind(&record.html_url)
            .bind(&record.url)
            .bind(&record.comment_url)
            .bind(&record.shortened_url)
            .bind(&record.rating)
            .bind(record.vote_count)
            .bind(record.comment_count)
            .bind(record.assignee.id)
            .bind(&record.assignee.name)
            .bind(&record.assignee.role)
            .bind(record.reporter.id)
            .bind(&record.reporter.name)
            .bind(&record.reporter.role)
            .bind(record.request_type.id)
            .bind(&record.request_type.title)
            .bind(&record.request_type.organization)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::from_row_write(record.external_id, err))?;

        Ok(match row {
            None => UpsertOutcome::Stale,
            Some(row) if row.try_get::<bool, _>("inserted")? => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
        })
    }

    async fn load_all(&self) -> Result<Vec<IssueRecord>, StoreError> {
        let rows = sqlx::query(SELECT_ALL_SQL).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| issue_from_row(row).map_err(|e| StoreError::Corrupt(e.to_string())))
            .collect()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM issues")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

fn issue_from_row(row: &PgRow) -> Result<IssueRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(IssueRecord {
        external_id: row.try_get("external_id")?,
        summary: row.try_get("summary")?,
        description: row.try_get("description")?,
        status: IssueStatus::parse(&status),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        closed_at: row.try_get("closed_at")?,
        lat: row.try_get("lat")?,
        lng: row.try_get("lng")?,
        address: row.try_get("address")?,
        html_url: row.try_get("html_url")?,
        url: row.try_get("url")?,
        comment_url: row.try_get("comment_url")?,
        shortened_url: row.try_get("shortened_url")?,
        rating: row.try_get("rating")?,
        vote_count: row.try_get("vote_count")?,
        comment_count: row.try_get("comment_count")?,
        assignee: Person {
            id: row.try_get("assignee_id")?,
            name: row.try_get("assignee_name")?,
            role: row.try_get("assignee_role")?,
        },
        reporter: Person {
            id: row.try_get("reporter_id")?,
            name: row.try_get("reporter_name")?,
            role: row.try_get("reporter_role")?,
        },
        request_type: RequestType {
            id: row.try_get("request_type_id")?,
            title: row.try_get("request_type_title")?,
            organization: row.try_get("request_type_organization")?,
        },
    })
}
