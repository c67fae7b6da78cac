//! Long-lived global objectives tracked across sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::Priority;

/// Completion state of a global objective.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveStatus {
    /// Still accruing progress.
    Active,
    /// Progress reached 1.0.
    Completed,
}

/// A unit of progress that outlives any single session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalObjective {
    /// Unique objective identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Relative importance.
    pub priority: Priority,
    /// Named target values.
    pub target_metrics: HashMap<String, f64>,
    /// Conditions that define completion.
    pub completion_criteria: Vec<String>,
    /// Progress in `[0, 1]`; never decreases.
    pub progress: f64,
    /// Completion state.
    pub status: ObjectiveStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last progress change.
    pub updated_at: DateTime<Utc>,
}

impl GlobalObjective {
    /// Construct an active objective with zero progress.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        priority: Priority,
        target_metrics: HashMap<String, f64>,
        completion_criteria: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            priority,
            target_metrics,
            completion_criteria,
            progress: 0.0,
            status: ObjectiveStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the objective has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == ObjectiveStatus::Completed
    }
}

/// Clamp a progress value to `[0, 1]`, mapping NaN to 0.
#[must_use]
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
