//! Recovery audit events and continuity metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit record of one recovery attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryEvent {
    /// Unique record identifier.
    pub id: String,
    /// Session owning the checkpoint, or `unknown` if it was not found.
    pub session_id: String,
    /// Checkpoint the recovery read from.
    pub checkpoint_id: String,
    /// Whether the snapshot was reconstructed.
    pub success: bool,
    /// Wall-clock time spent, in milliseconds.
    pub elapsed_ms: i64,
    /// Failure reason or short summary.
    pub detail: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl RecoveryEvent {
    /// Construct a recovery event stamped now.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        success: bool,
        elapsed_ms: i64,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            checkpoint_id: checkpoint_id.into(),
            success,
            elapsed_ms,
            detail,
            created_at: Utc::now(),
        }
    }
}

/// Aggregate counters over checkpoints, recoveries and bridges.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ContinuityMetrics {
    /// Checkpoints stored.
    pub total_checkpoints: u64,
    /// Checkpoints per type label.
    pub checkpoints_by_type: BTreeMap<String, u64>,
    /// Recovery attempts recorded.
    pub total_recoveries: u64,
    /// Recovery attempts that succeeded.
    pub successful_recoveries: u64,
    /// `successful / total`, or 0 with no attempts.
    pub recovery_success_rate: f64,
    /// Mean elapsed time of all attempts.
    pub average_recovery_ms: f64,
    /// Continuity bridges stored.
    pub total_bridges: u64,
}
