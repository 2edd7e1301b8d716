//! Durable stores, atomic file writes and HTTP fetch utilities.

use thiserror::Error;

pub mod atomic;
pub mod checkpoint;
pub mod http;
pub mod issues;

pub use atomic::{sha256_hex, write_atomic, WrittenFile};
pub use checkpoint::{render_checkpoint, CheckpointStore, MemoryCheckpointStore, PgCheckpointStore};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RequestPacer, RetryDisposition,
};
pub use issues::{IssueStore, MemoryIssueStore, PgIssueStore, UpsertOutcome};

pub const CRATE_NAME: &str = "civic-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("stored row could not be read back: {0}")]
    Corrupt(String),
    /// The database refused this one row; other rows can still be written.
    #[error("issue {external_id} rejected by the store: {reason}")]
    Rejected { external_id: i64, reason: String },
}

impl StoreError {
    /// Map a failed single-row write. Data exceptions (SQLSTATE class 22) and
    /// integrity violations (class 23) belong to the row; anything else means
    /// the store itself is unreachable or broken.
    pub fn from_row_write(external_id: i64, err: sqlx::Error) -> Self {
        let row_level = match &err {
            sqlx::Error::Database(db) => db.code().is_some_and(|code| is_row_level_sqlstate(&code)),
            _ => false,
        };
        if row_level {
            Self::Rejected {
                external_id,
                reason: err.to_string(),
            }
        } else {
            Self::Unavailable(err)
        }
    }
}

fn is_row_level_sqlstate(code: &str) -> bool {
    code.starts_with("22") || code.starts_with("23")
}

/// Connect to Postgres and apply the bundled migrations.
pub async fn connect_and_migrate(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
    use anyhow::Context;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to issue store")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("applying migrations")?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_exceptions_are_row_level() {
        // invalid byte sequence for encoding, not-null and check violations
        assert!(is_row_level_sqlstate("22021"));
        assert!(is_row_level_sqlstate("23502"));
        assert!(is_row_level_sqlstate("23514"));
        // connection failure, admin shutdown
        assert!(!is_row_level_sqlstate("08006"));
        assert!(!is_row_level_sqlstate("57P01"));
    }

    #[test]
    fn pool_and_io_failures_stay_unavailable() {
        assert!(matches!(
            StoreError::from_row_write(7, sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from_row_write(7, sqlx::Error::RowNotFound),
            StoreError::Unavailable(_)
        ));
    }
}
