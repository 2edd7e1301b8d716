//! Durable "last processed update" marker, one value per ingestion source.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

use crate::StoreError;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Record `seen` for `source` unless the stored value is already later.
    /// Returns the value held after the call.
    async fn advance(&self, source: &str, seen: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError>;
}

/// Wire form used in API queries and logs.
pub fn render_checkpoint(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    values: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.values.lock().await.get(source).copied())
    }

    async fn advance(&self, source: &str, seen: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        let mut values = self.values.lock().await;
        let entry = values.entry(source.to_string()).or_insert(seen);
        if seen > *entry {
            *entry = seen;
        }
        Ok(*entry)
    }
}

#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, source: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT last_updated_at FROM sync_checkpoints WHERE source = $1")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.try_get::<DateTime<Utc>, _>("last_updated_at"))
            .transpose()?)
    }

    async fn advance(&self, source: &str, seen: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (source, last_updated_at, recorded_at)
            VALUES ($1, $2, now())
            ON CONFLICT (source) DO UPDATE SET
                last_updated_at = GREATEST(sync_checkpoints.last_updated_at, EXCLUDED.last_updated_at),
                recorded_at = now()
            RETURNING last_updated_at
            "#,
        )
        .bind(source)
        .bind(seen)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("last_updated_at")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn memory_checkpoint_never_moves_backwards() {
        let store = MemoryCheckpointStore::new();
        assert_eq!(store.load("scf").await.unwrap(), None);

        assert_eq!(store.advance("scf", ts(5)).await.unwrap(), ts(5));
        assert_eq!(store.advance("scf", ts(3)).await.unwrap(), ts(5));
        assert_eq!(store.advance("scf", ts(9)).await.unwrap(), ts(9));
        assert_eq!(store.load("scf").await.unwrap(), Some(ts(9)));
        assert_eq!(store.load("other").await.unwrap(), None);
    }

    #[test]
    fn renders_zulu_seconds() {
        assert_eq!(render_checkpoint(ts(7)), "2024-05-01T07:00:00Z");
    }
}
