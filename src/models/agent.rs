//! Worker agent model and metrics bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a pooled agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Available for dispatch.
    Idle,
    /// Executing exactly one task.
    Working,
    /// Finished its last task successfully; returns to idle next cycle.
    Completed,
    /// Finished its last task with an error; returns to idle next cycle.
    Error,
    /// Taken out of rotation after repeated failures.
    Paused,
}

/// A pooled worker that runs one task at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Agent {
    /// Unique agent identifier.
    pub id: String,
    /// Capability label the agent is currently bound to.
    pub capability: String,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Task currently executing.
    pub current_task: Option<String>,
    /// Tasks finished successfully.
    pub tasks_completed: u64,
    /// Tasks finished with an error.
    pub tasks_failed: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Running average task latency in milliseconds.
    pub avg_latency_ms: f64,
    /// `completed / (completed + failed)`.
    pub success_rate: f64,
    /// Spawn timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time the agent finished a task.
    pub last_active_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// Spawn an idle agent bound to `capability`.
    #[must_use]
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            id: format!("agent-{}", Uuid::new_v4().simple()),
            capability: capability.into(),
            status: AgentStatus::Idle,
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            success_rate: 0.0,
            created_at: Utc::now(),
            last_active_at: None,
        }
    }

    /// Whether the agent can take a task right now.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    /// Fold a finished task into the agent's metrics and leave it in
    /// `Completed` or `Error`.
    #[allow(clippy::cast_precision_loss)] // Task counts stay far below 2^52.
    pub fn record_outcome(&mut self, success: bool, latency_ms: f64) {
        if success {
            self.tasks_completed += 1;
            self.consecutive_failures = 0;
            self.status = AgentStatus::Completed;
        } else {
            self.tasks_failed += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.status = AgentStatus::Error;
        }
        let finished = self.tasks_completed + self.tasks_failed;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / finished as f64;
        self.success_rate = self.tasks_completed as f64 / finished as f64;
        self.current_task = None;
        self.last_active_at = Some(Utc::now());
    }
}
