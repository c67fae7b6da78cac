//! Global objective repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::objective::{clamp_progress, GlobalObjective, ObjectiveStatus};
use crate::models::task::Priority;
use crate::models::{format_timestamp, parse_timestamp};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for global objectives.
#[derive(Clone)]
pub struct ObjectiveRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ObjectiveRow {
    id: String,
    name: String,
    priority: String,
    target_metrics_json: String,
    completion_criteria_json: String,
    progress: f64,
    status: String,
    created_at: String,
    updated_at: String,
}

impl ObjectiveRow {
    fn into_objective(self) -> Result<GlobalObjective> {
        let priority = Priority::parse(&self.priority)
            .ok_or_else(|| AppError::Db(format!("invalid objective priority: {}", self.priority)))?;
        let status = parse_objective_status(&self.status)?;
        let target_metrics = serde_json::from_str(&self.target_metrics_json)
            .map_err(|e| AppError::Db(format!("invalid target_metrics_json: {e}")))?;
        let completion_criteria = serde_json::from_str(&self.completion_criteria_json)
            .map_err(|e| AppError::Db(format!("invalid completion_criteria_json: {e}")))?;

        Ok(GlobalObjective {
            id: self.id,
            name: self.name,
            priority,
            target_metrics,
            completion_criteria,
            progress: self.progress,
            status,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

fn parse_objective_status(s: &str) -> Result<ObjectiveStatus> {
    match s {
        "active" => Ok(ObjectiveStatus::Active),
        "completed" => Ok(ObjectiveStatus::Completed),
        other => Err(AppError::Db(format!("invalid objective status: {other}"))),
    }
}

fn objective_status_str(s: ObjectiveStatus) -> &'static str {
    match s {
        ObjectiveStatus::Active => "active",
        ObjectiveStatus::Completed => "completed",
    }
}

impl ObjectiveRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new objective.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, objective: &GlobalObjective) -> Result<GlobalObjective> {
        let target_metrics_json = serde_json::to_string(&objective.target_metrics)?;
        let completion_criteria_json = serde_json::to_string(&objective.completion_criteria)?;

        sqlx::query(
            "INSERT INTO global_objectives (id, name, priority, target_metrics_json,
             completion_criteria_json, progress, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&objective.id)
        .bind(&objective.name)
        .bind(objective.priority.as_str())
        .bind(&target_metrics_json)
        .bind(&completion_criteria_json)
        .bind(objective.progress)
        .bind(objective_status_str(objective.status))
        .bind(format_timestamp(&objective.created_at))
        .bind(format_timestamp(&objective.updated_at))
        .execute(self.db.as_ref())
        .await?;

        Ok(objective.clone())
    }

    /// Retrieve an objective by ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<GlobalObjective>> {
        let row: Option<ObjectiveRow> =
            sqlx::query_as("SELECT * FROM global_objectives WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(ObjectiveRow::into_objective).transpose()
    }

    /// All objectives, highest priority first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<GlobalObjective>> {
        let rows: Vec<ObjectiveRow> =
            sqlx::query_as("SELECT * FROM global_objectives ORDER BY created_at ASC")
                .fetch_all(self.db.as_ref())
                .await?;

        let mut objectives = rows
            .into_iter()
            .map(ObjectiveRow::into_objective)
            .collect::<Result<Vec<_>>>()?;
        objectives.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(objectives)
    }

    /// Objectives still accruing progress.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_active(&self) -> Result<Vec<GlobalObjective>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|objective| objective.status == ObjectiveStatus::Active)
            .collect())
    }

    /// Objectives with the given ids, skipping unknown ones.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn get_many(&self, ids: &[String]) -> Result<Vec<GlobalObjective>> {
        let mut objectives = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(objective) = self.get_by_id(id).await? {
                objectives.push(objective);
            }
        }
        Ok(objectives)
    }

    /// Raise an objective's progress to `value` if higher.
    ///
    /// The comparison happens inside the `UPDATE` so concurrent writers can
    /// never lower a stored value. Reaching 1.0 marks the objective completed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no objective has `id`, or
    /// `AppError::Db` if the update fails.
    pub async fn raise_progress(&self, id: &str, value: f64) -> Result<GlobalObjective> {
        let value = clamp_progress(value);
        let now = format_timestamp(&Utc::now());

        let result = sqlx::query(
            "UPDATE global_objectives
             SET progress = MAX(progress, ?2),
                 status = CASE WHEN MAX(progress, ?2) >= 1.0 THEN 'completed' ELSE status END,
                 updated_at = CASE WHEN ?2 > progress THEN ?3 ELSE updated_at END
             WHERE id = ?1",
        )
        .bind(id)
        .bind(value)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("objective {id} not found")));
        }

        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("objective {id} not found")))
    }
}
