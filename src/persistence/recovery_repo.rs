//! Recovery event repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::recovery::RecoveryEvent;
use crate::models::{format_timestamp, parse_timestamp};
use crate::Result;

use super::db::Database;

/// Repository wrapper around `SQLite` for recovery audit events.
#[derive(Clone)]
pub struct RecoveryRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct RecoveryRow {
    id: String,
    session_id: String,
    checkpoint_id: String,
    success: i64,
    elapsed_ms: i64,
    detail: Option<String>,
    created_at: String,
}

impl RecoveryRow {
    fn into_event(self) -> Result<RecoveryEvent> {
        Ok(RecoveryEvent {
            id: self.id,
            session_id: self.session_id,
            checkpoint_id: self.checkpoint_id,
            success: self.success != 0,
            elapsed_ms: self.elapsed_ms,
            detail: self.detail,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}

/// Aggregate over all recorded recovery attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecoveryTotals {
    /// Attempts recorded.
    pub total: u64,
    /// Attempts that succeeded.
    pub successful: u64,
    /// Mean elapsed milliseconds.
    pub average_elapsed_ms: f64,
}

impl RecoveryRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a recovery event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, event: &RecoveryEvent) -> Result<RecoveryEvent> {
        sqlx::query(
            "INSERT INTO recovery_events (id, session_id, checkpoint_id, success,
             elapsed_ms, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&event.id)
        .bind(&event.session_id)
        .bind(&event.checkpoint_id)
        .bind(i64::from(event.success))
        .bind(event.elapsed_ms)
        .bind(&event.detail)
        .bind(format_timestamp(&event.created_at))
        .execute(self.db.as_ref())
        .await?;

        Ok(event.clone())
    }

    /// Events recorded against a checkpoint, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_checkpoint(&self, checkpoint_id: &str) -> Result<Vec<RecoveryEvent>> {
        let rows: Vec<RecoveryRow> = sqlx::query_as(
            "SELECT * FROM recovery_events WHERE checkpoint_id = ?1 ORDER BY created_at ASC",
        )
        .bind(checkpoint_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(RecoveryRow::into_event).collect()
    }

    /// Count, success count and mean latency over all events.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn totals(&self) -> Result<RecoveryTotals> {
        let (total, successful, average): (i64, Option<i64>, Option<f64>) = sqlx::query_as(
            "SELECT COUNT(*), SUM(success), AVG(CAST(elapsed_ms AS REAL)) FROM recovery_events",
        )
        .fetch_one(self.db.as_ref())
        .await?;

        Ok(RecoveryTotals {
            total: u64::try_from(total).unwrap_or(0),
            successful: u64::try_from(successful.unwrap_or(0)).unwrap_or(0),
            average_elapsed_ms: average.unwrap_or(0.0),
        })
    }

    /// Delete events recorded before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM recovery_events WHERE created_at < ?1")
            .bind(format_timestamp(&cutoff))
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
