//! Immutable checkpoint snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Policy point at which a checkpoint was taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Periodic or pre-task snapshot.
    Automatic,
    /// Operator-requested snapshot.
    Manual,
    /// Taken immediately before handing off to a child session.
    PreDelegation,
    /// Taken after a critical task failed.
    ErrorRecovery,
    /// Taken after a task finished.
    Milestone,
}

impl CheckpointType {
    /// Stable storage label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::PreDelegation => "pre_delegation",
            Self::ErrorRecovery => "error_recovery",
            Self::Milestone => "milestone",
        }
    }

    /// Parse a storage label.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "automatic" => Some(Self::Automatic),
            "manual" => Some(Self::Manual),
            "pre_delegation" => Some(Self::PreDelegation),
            "error_recovery" => Some(Self::ErrorRecovery),
            "milestone" => Some(Self::Milestone),
            _ => None,
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state captured by a checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointSnapshot {
    /// Session context, stored compressed when large.
    pub context: serde_json::Value,
    /// Objective states at checkpoint time.
    pub objectives: serde_json::Value,
    /// Accumulated task results.
    pub results: serde_json::Value,
    /// Agent pool state, when captured.
    pub agent_states: Option<serde_json::Value>,
}

/// A persisted snapshot of session state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// Unique record identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Policy point that produced it.
    pub checkpoint_type: CheckpointType,
    /// Captured state.
    pub snapshot: CheckpointSnapshot,
    /// Stored size of the context blob in bytes.
    pub size_bytes: i64,
    /// Whether the context blob is gzip-compressed at rest.
    pub compressed: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Construct a checkpoint; size and compression are filled in on write.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        checkpoint_type: CheckpointType,
        snapshot: CheckpointSnapshot,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            checkpoint_type,
            snapshot,
            size_bytes: 0,
            compressed: false,
            created_at: Utc::now(),
        }
    }
}
