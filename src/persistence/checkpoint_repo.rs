//! Checkpoint repository for `SQLite` persistence.
//!
//! The context snapshot is stored as a blob and gzip-compressed when its
//! JSON encoding exceeds the configured threshold. Objective, result and
//! agent-state snapshots are stored as JSON text.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::checkpoint::{Checkpoint, CheckpointSnapshot, CheckpointType};
use crate::models::{format_timestamp, parse_timestamp};
use crate::{AppError, Result};

use super::compression;
use super::db::Database;

const SELECT_COLUMNS: &str = "SELECT id, session_id, type AS checkpoint_type, timestamp, \
     context_blob, compressed, objectives_json, results_json, agent_states_json, size_bytes \
     FROM checkpoints";

/// Repository wrapper around `SQLite` for checkpoint records.
#[derive(Clone)]
pub struct CheckpointRepo {
    db: Arc<Database>,
    compression_threshold: usize,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: String,
    session_id: String,
    checkpoint_type: String,
    timestamp: String,
    context_blob: Vec<u8>,
    compressed: i64,
    objectives_json: String,
    results_json: String,
    agent_states_json: Option<String>,
    size_bytes: i64,
}

impl CheckpointRow {
    /// Convert a database row into the domain model, inflating the context.
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let checkpoint_type = CheckpointType::parse(&self.checkpoint_type).ok_or_else(|| {
            AppError::Db(format!("invalid checkpoint type: {}", self.checkpoint_type))
        })?;
        let compressed = self.compressed != 0;
        let context_bytes = if compressed {
            compression::decompress(&self.context_blob)?
        } else {
            self.context_blob
        };
        let context = serde_json::from_slice(&context_bytes)
            .map_err(|e| AppError::Codec(format!("invalid context snapshot: {e}")))?;
        let objectives = serde_json::from_str(&self.objectives_json)
            .map_err(|e| AppError::Codec(format!("invalid objectives snapshot: {e}")))?;
        let results = serde_json::from_str(&self.results_json)
            .map_err(|e| AppError::Codec(format!("invalid results snapshot: {e}")))?;
        let agent_states = self
            .agent_states_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Codec(format!("invalid agent states snapshot: {e}")))?;

        Ok(Checkpoint {
            id: self.id,
            session_id: self.session_id,
            checkpoint_type,
            snapshot: CheckpointSnapshot {
                context,
                objectives,
                results,
                agent_states,
            },
            size_bytes: self.size_bytes,
            compressed,
            created_at: parse_timestamp("timestamp", &self.timestamp)?,
        })
    }
}

impl CheckpointRepo {
    /// Create a new repository instance.
    ///
    /// Context snapshots whose JSON encoding is longer than
    /// `compression_threshold` bytes are compressed on write.
    #[must_use]
    pub fn new(db: Arc<Database>, compression_threshold: usize) -> Self {
        Self {
            db,
            compression_threshold,
        }
    }

    /// Insert a checkpoint and return it with its stored size and
    /// compression flag filled in.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Codec` if a snapshot cannot be encoded, or
    /// `AppError::Db` if the insert fails.
    pub async fn create(&self, checkpoint: &Checkpoint) -> Result<Checkpoint> {
        let snapshot = &checkpoint.snapshot;
        let context_bytes = serde_json::to_vec(&snapshot.context)?;
        let compressed = context_bytes.len() > self.compression_threshold;
        let blob = if compressed {
            compression::compress(&context_bytes)?
        } else {
            context_bytes
        };
        let size_bytes = i64::try_from(blob.len())
            .map_err(|_| AppError::Codec("context snapshot too large".into()))?;
        let objectives_json = serde_json::to_string(&snapshot.objectives)?;
        let results_json = serde_json::to_string(&snapshot.results)?;
        let agent_states_json = snapshot
            .agent_states
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let timestamp = format_timestamp(&checkpoint.created_at);

        sqlx::query(
            "INSERT INTO checkpoints (id, session_id, type, timestamp, context_blob,
             compressed, objectives_json, results_json, agent_states_json, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.session_id)
        .bind(checkpoint.checkpoint_type.as_str())
        .bind(&timestamp)
        .bind(&blob)
        .bind(i64::from(compressed))
        .bind(&objectives_json)
        .bind(&results_json)
        .bind(&agent_states_json)
        .bind(size_bytes)
        .execute(self.db.as_ref())
        .await?;

        let mut stored = checkpoint.clone();
        stored.size_bytes = size_bytes;
        stored.compressed = compressed;
        Ok(stored)
    }

    /// Retrieve a checkpoint by ID.
    ///
    /// Returns `Ok(None)` if the checkpoint does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails, or `AppError::Codec` if
    /// the stored snapshot cannot be decoded.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Owning session of a checkpoint, read without decoding its payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn session_of(&self, id: &str) -> Result<Option<String>> {
        let session_id: Option<String> =
            sqlx::query_scalar("SELECT session_id FROM checkpoints WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(session_id)
    }

    /// List all checkpoints for a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY timestamp ASC, rowid ASC"
        ))
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(CheckpointRow::into_checkpoint)
            .collect()
    }

    /// Most recent checkpoint for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn latest_for_session(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT 1"
        ))
        .bind(session_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Checkpoint counts keyed by type label.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_by_type(&self) -> Result<BTreeMap<String, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT type, COUNT(*) FROM checkpoints GROUP BY type")
                .fetch_all(self.db.as_ref())
                .await?;

        Ok(rows
            .into_iter()
            .map(|(label, count)| (label, u64::try_from(count).unwrap_or(0)))
            .collect())
    }

    /// Delete checkpoints older than `cutoff`.
    ///
    /// The newest checkpoint of every session is kept unless the session is
    /// recorded with a terminal status. Sessions unknown to the `sessions`
    /// table are treated as still active.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM checkpoints
             WHERE timestamp < ?1
               AND id NOT IN (
                   SELECT c.id FROM checkpoints c
                   WHERE c.rowid = (
                       SELECT c2.rowid FROM checkpoints c2
                       WHERE c2.session_id = c.session_id
                       ORDER BY c2.timestamp DESC, c2.rowid DESC
                       LIMIT 1
                   )
                   AND c.session_id NOT IN (
                       SELECT id FROM sessions
                       WHERE status IN ('delegated', 'completed', 'failed')
                   )
               )",
        )
        .bind(format_timestamp(&cutoff))
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }
}
