//! Continuity bridge repository for `SQLite` persistence.

use std::sync::Arc;

use crate::models::bridge::ContinuityBridge;
use crate::models::{format_timestamp, parse_timestamp};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for continuity bridges.
#[derive(Clone)]
pub struct BridgeRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct BridgeRow {
    id: String,
    source_session: String,
    target_session: String,
    timestamp: String,
    objective_ids_json: String,
    progress_map_json: String,
    integrity_hash: String,
}

impl BridgeRow {
    fn into_bridge(self) -> Result<ContinuityBridge> {
        let objective_ids = serde_json::from_str(&self.objective_ids_json)
            .map_err(|e| AppError::Db(format!("invalid objective_ids_json: {e}")))?;
        let progress_map = serde_json::from_str(&self.progress_map_json)
            .map_err(|e| AppError::Db(format!("invalid progress_map_json: {e}")))?;

        Ok(ContinuityBridge {
            id: self.id,
            source_session: self.source_session,
            target_session: self.target_session,
            objective_ids,
            progress_map,
            integrity_hash: self.integrity_hash,
            created_at: parse_timestamp("timestamp", &self.timestamp)?,
        })
    }
}

impl BridgeRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a bridge record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, bridge: &ContinuityBridge) -> Result<ContinuityBridge> {
        let objective_ids_json = serde_json::to_string(&bridge.objective_ids)?;
        let progress_map_json = serde_json::to_string(&bridge.progress_map)?;

        sqlx::query(
            "INSERT INTO continuity_bridges (id, source_session, target_session, timestamp,
             objective_ids_json, progress_map_json, integrity_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&bridge.id)
        .bind(&bridge.source_session)
        .bind(&bridge.target_session)
        .bind(format_timestamp(&bridge.created_at))
        .bind(&objective_ids_json)
        .bind(&progress_map_json)
        .bind(&bridge.integrity_hash)
        .execute(self.db.as_ref())
        .await?;

        Ok(bridge.clone())
    }

    /// Retrieve a bridge by ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ContinuityBridge>> {
        let row: Option<BridgeRow> =
            sqlx::query_as("SELECT * FROM continuity_bridges WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(BridgeRow::into_bridge).transpose()
    }

    /// Bridges created by a delegating session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_from_source(&self, source_session: &str) -> Result<Vec<ContinuityBridge>> {
        let rows: Vec<BridgeRow> = sqlx::query_as(
            "SELECT * FROM continuity_bridges WHERE source_session = ?1 ORDER BY timestamp ASC",
        )
        .bind(source_session)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(BridgeRow::into_bridge).collect()
    }

    /// Total number of bridges.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM continuity_bridges")
            .fetch_one(self.db.as_ref())
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
