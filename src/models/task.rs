//! Task request and scheduled task models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatch priority; variants are ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    #[serde(alias = "LOW")]
    Low,
    /// Regular work.
    #[default]
    #[serde(alias = "MEDIUM")]
    Medium,
    /// Work that should jump the queue.
    #[serde(alias = "HIGH")]
    High,
    /// Work whose failure triggers an error-recovery checkpoint.
    #[serde(alias = "CRITICAL")]
    Critical,
}

impl Priority {
    /// Stable lower-case label used in storage and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse a stored label (case-insensitive).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// A unit of work submitted by a collaborator, before admission.
///
/// Every field is optional on the wire so that malformed requests reach
/// the gate and are rejected with a specific issue instead of failing to
/// deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct TaskRequest {
    /// Caller-supplied identifier; generated when absent.
    pub task_id: Option<String>,
    /// Short human-readable name.
    pub name: Option<String>,
    /// What the task must achieve.
    pub objective: String,
    /// What the task hands back when done.
    pub deliverable: Option<String>,
    /// Conditions under which the deliverable is accepted.
    pub success_criteria: Vec<String>,
    /// Business value statement.
    pub business_value: Option<String>,
    /// Named impact estimates, each in `[0, 1]`.
    pub impact_assessment: HashMap<String, f64>,
    /// Capability tags the task needs.
    pub required_capabilities: Vec<String>,
    /// Capability tags the caller knows to be available.
    pub available_capabilities: Vec<String>,
    /// Alternatives per required capability.
    pub capability_fallbacks: HashMap<String, Vec<String>>,
    /// Executor routing tag; defaults to the first required capability.
    pub capability: Option<String>,
    /// Task ids that must complete first.
    pub dependencies: Vec<String>,
    /// Dispatch priority.
    pub priority: Priority,
    /// Global objectives this task advances.
    pub objective_ids: Vec<String>,
    /// Context budget charged on completion.
    pub budget_cost: Option<u64>,
    /// Opaque domain payload handed to the executor.
    pub payload: serde_json::Value,
}

impl TaskRequest {
    /// Build a request with only an objective set.
    #[must_use]
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            ..Self::default()
        }
    }

    /// Tag used to route the task to an executor.
    #[must_use]
    pub fn routing_capability(&self) -> String {
        self.capability
            .clone()
            .or_else(|| self.required_capabilities.first().cloned())
            .unwrap_or_else(|| "general".to_owned())
    }
}

/// Lifecycle status for a scheduled task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Pending,
    /// Executing on an agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// Whether the task has reached a final state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// An admitted task tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Executor routing tag.
    pub capability: String,
    /// Dispatch priority.
    pub priority: Priority,
    /// Task ids that must complete first.
    pub dependencies: Vec<String>,
    /// Opaque domain payload.
    pub payload: serde_json::Value,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Agent the task was dispatched to.
    pub assigned_agent: Option<String>,
    /// Opaque result on success.
    pub result: Option<serde_json::Value>,
    /// Error description on failure.
    pub error: Option<String>,
    /// Arrival order, assigned on enqueue.
    pub seq: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Dispatch timestamp.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion timestamp.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Construct a pending task.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        capability: impl Into<String>,
        priority: Priority,
        dependencies: Vec<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            capability: capability.into(),
            priority,
            dependencies,
            payload,
            status: TaskStatus::Pending,
            assigned_agent: None,
            result: None,
            error: None,
            seq: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Build a task from an admitted request, keeping its id if it has one.
    #[must_use]
    pub fn from_request(request: &TaskRequest) -> Self {
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| request.objective.chars().take(60).collect());
        let mut task = Self::new(
            name,
            request.routing_capability(),
            request.priority,
            request.dependencies.clone(),
            request.payload.clone(),
        );
        if let Some(id) = &request.task_id {
            task.id.clone_from(id);
        }
        task
    }

    /// Builder-style override of the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}
