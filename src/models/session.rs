//! Session context and genealogy helpers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of a session in the delegation tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionLevel {
    /// Root session.
    Meta,
    /// First delegation.
    Primary,
    /// Second delegation.
    Secondary,
    /// Third delegation and deeper.
    Worker,
}

impl SessionLevel {
    /// Level for a session at `depth` (root is 0).
    #[must_use]
    pub fn for_depth(depth: u32) -> Self {
        match depth {
            0 => Self::Meta,
            1 => Self::Primary,
            2 => Self::Secondary,
            _ => Self::Worker,
        }
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting work and consuming budget.
    Active,
    /// Handed its objectives to a child session.
    Delegated,
    /// Every bound objective completed.
    Completed,
    /// Stopped without completing.
    Failed,
}

impl SessionStatus {
    /// Whether the session has reached its single terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Active => "active",
            Self::Delegated => "delegated",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Budget-tracking record for one node of the session genealogy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionContext {
    /// Unique session identifier.
    pub id: String,
    /// Session that delegated to this one.
    pub parent_id: Option<String>,
    /// Sessions this one delegated to.
    pub child_ids: Vec<String>,
    /// Level in the genealogy.
    pub level: SessionLevel,
    /// Distance from the root session.
    pub depth: u32,
    /// Global objectives bound to this session.
    pub objective_ids: Vec<String>,
    /// Budget consumed so far.
    pub consumed_budget: u64,
    /// Budget available to this session.
    pub budget_limit: u64,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl SessionContext {
    /// Construct a root session.
    #[must_use]
    pub fn new(objective_ids: Vec<String>, budget_limit: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            child_ids: Vec::new(),
            level: SessionLevel::Meta,
            depth: 0,
            objective_ids,
            consumed_budget: 0,
            budget_limit,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Construct a session one level below `parent`.
    #[must_use]
    pub fn child_of(parent: &Self, objective_ids: Vec<String>, budget_limit: u64) -> Self {
        let depth = parent.depth + 1;
        Self {
            parent_id: Some(parent.id.clone()),
            level: SessionLevel::for_depth(depth),
            depth,
            ..Self::new(objective_ids, budget_limit)
        }
    }

    /// Consumed budget as a fraction of the limit.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Budget values are far below 2^52.
    pub fn usage_ratio(&self) -> f64 {
        if self.budget_limit == 0 {
            return 1.0;
        }
        self.consumed_budget as f64 / self.budget_limit as f64
    }

    /// Whether the session still accepts work.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}
