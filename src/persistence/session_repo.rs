//! Session genealogy repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::session::{SessionContext, SessionLevel, SessionStatus};
use crate::models::{format_timestamp, parse_timestamp};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    parent_id: Option<String>,
    child_ids: String,
    level: String,
    depth: i64,
    objective_ids: String,
    consumed_budget: i64,
    budget_limit: i64,
    status: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<SessionContext> {
        let child_ids = serde_json::from_str(&self.child_ids)
            .map_err(|e| AppError::Db(format!("invalid child_ids: {e}")))?;
        let objective_ids = serde_json::from_str(&self.objective_ids)
            .map_err(|e| AppError::Db(format!("invalid objective_ids: {e}")))?;

        Ok(SessionContext {
            id: self.id,
            parent_id: self.parent_id,
            child_ids,
            level: parse_level(&self.level)?,
            depth: u32::try_from(self.depth)
                .map_err(|e| AppError::Db(format!("invalid depth: {e}")))?,
            objective_ids,
            consumed_budget: u64::try_from(self.consumed_budget)
                .map_err(|e| AppError::Db(format!("invalid consumed_budget: {e}")))?,
            budget_limit: u64::try_from(self.budget_limit)
                .map_err(|e| AppError::Db(format!("invalid budget_limit: {e}")))?,
            status: parse_status(&self.status)?,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

fn parse_level(s: &str) -> Result<SessionLevel> {
    match s {
        "meta" => Ok(SessionLevel::Meta),
        "primary" => Ok(SessionLevel::Primary),
        "secondary" => Ok(SessionLevel::Secondary),
        "worker" => Ok(SessionLevel::Worker),
        other => Err(AppError::Db(format!("invalid session level: {other}"))),
    }
}

fn level_str(level: SessionLevel) -> &'static str {
    match level {
        SessionLevel::Meta => "meta",
        SessionLevel::Primary => "primary",
        SessionLevel::Secondary => "secondary",
        SessionLevel::Worker => "worker",
    }
}

fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "active" => Ok(SessionStatus::Active),
        "delegated" => Ok(SessionStatus::Delegated),
        "completed" => Ok(SessionStatus::Completed),
        "failed" => Ok(SessionStatus::Failed),
        other => Err(AppError::Db(format!("invalid session status: {other}"))),
    }
}

fn budget_to_i64(field: &str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| AppError::Db(format!("{field} out of range: {value}")))
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, session: &SessionContext) -> Result<SessionContext> {
        sqlx::query(
            "INSERT INTO sessions (id, parent_id, child_ids, level, depth, objective_ids,
             consumed_budget, budget_limit, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&session.id)
        .bind(&session.parent_id)
        .bind(serde_json::to_string(&session.child_ids)?)
        .bind(level_str(session.level))
        .bind(i64::from(session.depth))
        .bind(serde_json::to_string(&session.objective_ids)?)
        .bind(budget_to_i64("consumed_budget", session.consumed_budget)?)
        .bind(budget_to_i64("budget_limit", session.budget_limit)?)
        .bind(session.status.to_string())
        .bind(format_timestamp(&session.created_at))
        .bind(format_timestamp(&session.updated_at))
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<SessionContext>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Persist the mutable fields of a session and bump `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn update(&self, session: &SessionContext) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sessions SET child_ids = ?2, objective_ids = ?3, consumed_budget = ?4,
             status = ?5, updated_at = ?6 WHERE id = ?1",
        )
        .bind(&session.id)
        .bind(serde_json::to_string(&session.child_ids)?)
        .bind(serde_json::to_string(&session.objective_ids)?)
        .bind(budget_to_i64("consumed_budget", session.consumed_budget)?)
        .bind(session.status.to_string())
        .bind(format_timestamp(&Utc::now()))
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {} not found", session.id)));
        }
        Ok(())
    }

    /// Sessions in the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_status(&self, status: SessionStatus) -> Result<Vec<SessionContext>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM sessions WHERE status = ?1 ORDER BY created_at ASC")
                .bind(status.to_string())
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }
}
