//! Upsert Writer: one page of raw payloads into the issue store.

use chrono::{DateTime, Utc};
use civic_core::{IssueRecord, RecordMalformed};
use civic_storage::{IssueStore, StoreError, UpsertOutcome};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

/// Outcome of one batch. Malformed payloads, and rows the store refuses on
/// their own, are counted, not fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Older than the stored row and left untouched.
    pub stale: usize,
    pub malformed: usize,
    /// Latest `updated_at` among records the store accepted (stale ones
    /// included, since a newer row is already durable for them).
    pub max_updated_at: Option<DateTime<Utc>>,
}

impl BatchReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Decode each payload independently.
pub fn decode_batch(payloads: &[JsonValue]) -> Vec<Result<IssueRecord, RecordMalformed>> {
    payloads.iter().map(IssueRecord::from_payload).collect()
}

/// Persist `payloads` record by record.
///
/// Not all-or-nothing: every well-formed record before a storage failure
/// stays written. A storage failure aborts the batch and is returned so the
/// caller leaves its checkpoint where it was.
pub async fn write_batch(
    store: &dyn IssueStore,
    payloads: &[JsonValue],
) -> Result<BatchReport, StoreError> {
    let mut report = BatchReport {
        received: payloads.len(),
        ..Default::default()
    };

    for decoded in decode_batch(payloads) {
        let record = match decoded {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    external_id = err.external_id.unwrap_or(-1),
                    reason = %err.reason,
                    "skipping malformed issue record"
                );
                report.malformed += 1;
                continue;
            }
        };

        let outcome = match store.upsert(&record).await {
            Ok(outcome) => outcome,
            Err(StoreError::Rejected { external_id, reason }) => {
                warn!(external_id, reason = %reason, "store rejected issue record; skipping");
                report.malformed += 1;
                continue;
            }
            Err(err) => return Err(err),
        };
        match outcome {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Stale => {
                warn!(
                    external_id = record.external_id,
                    updated_at = %record.updated_at,
                    "incoming record older than stored row; ignored"
                );
                report.stale += 1;
            }
        }
        report.max_updated_at = report.max_updated_at.max(Some(record.updated_at));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use civic_storage::MemoryIssueStore;
    use serde_json::json;

    /// Refuses one external id the way Postgres refuses a bad text value.
    struct RefusingStore {
        inner: MemoryIssueStore,
        refuse: i64,
    }

    #[async_trait]
    impl IssueStore for RefusingStore {
        async fn upsert(&self, record: &IssueRecord) -> Result<UpsertOutcome, StoreError> {
            if record.external_id == self.refuse {
                return Err(StoreError::Rejected {
                    external_id: record.external_id,
                    reason: "invalid byte sequence for encoding \"UTF8\": 0x00".into(),
                });
            }
            self.inner.upsert(record).await
        }

        async fn load_all(&self) -> Result<Vec<IssueRecord>, StoreError> {
            self.inner.load_all().await
        }

        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }
    }

    fn payload(id: i64, updated_at: &str) -> JsonValue {
        json!({
            "id": id,
            "status": "Open",
            "summary": "Illegal dumping",
            "created_at": "2024-03-01T08:00:00-08:00",
            "updated_at": updated_at,
            "lat": 47.25,
            "lng": -122.44
        })
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_and_the_rest_commit() {
        let store = MemoryIssueStore::new();
        let payloads = vec![
            payload(1, "2024-03-02T10:00:00Z"),
            json!({"id": 2, "status": "Open"}),
            json!({"summary": "no id at all"}),
            payload(3, "2024-03-02T12:30:00Z"),
        ];

        let report = write_batch(&store, &payloads).await.expect("batch");

        assert_eq!(report.received, 4);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.malformed, 2);
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(
            report.max_updated_at.map(civic_storage::render_checkpoint).as_deref(),
            Some("2024-03-02T12:30:00Z")
        );
    }

    #[tokio::test]
    async fn empty_or_fully_malformed_batch_has_no_max() {
        let store = MemoryIssueStore::new();
        assert_eq!(write_batch(&store, &[]).await.unwrap().max_updated_at, None);

        let report = write_batch(&store, &[json!({"id": "not a number"})])
            .await
            .unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(report.max_updated_at, None);
    }

    #[tokio::test]
    async fn rewriting_a_batch_updates_in_place() {
        let store = MemoryIssueStore::new();
        let payloads = vec![payload(9, "2024-03-02T10:00:00Z")];
        write_batch(&store, &payloads).await.unwrap();
        let again = write_batch(&store, &payloads).await.unwrap();

        assert_eq!(again.inserted, 0);
        assert_eq!(again.updated, 1);
        assert_eq!(again.written(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejected_row_is_skipped_and_does_not_move_the_max() {
        let store = RefusingStore {
            inner: MemoryIssueStore::new(),
            refuse: 2,
        };
        let payloads = vec![
            payload(1, "2024-03-02T10:00:00Z"),
            payload(2, "2024-03-02T11:00:00Z"),
        ];

        let report = write_batch(&store, &payloads).await.expect("batch");

        assert_eq!(report.inserted, 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(
            report.max_updated_at.map(civic_storage::render_checkpoint).as_deref(),
            Some("2024-03-02T10:00:00Z")
        );
    }
}
