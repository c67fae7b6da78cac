//! Continuity bridges linking a delegating session to its successor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::format_timestamp;

/// Persisted record of one delegation hand-off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ContinuityBridge {
    /// Unique bridge identifier.
    pub id: String,
    /// Delegating session.
    pub source_session: String,
    /// Receiving session.
    pub target_session: String,
    /// Objectives handed over.
    pub objective_ids: Vec<String>,
    /// Objective progress at hand-off time.
    pub progress_map: BTreeMap<String, f64>,
    /// SHA-256 over the transferred payload.
    pub integrity_hash: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ContinuityBridge {
    /// Construct a bridge and seal it with its integrity hash.
    #[must_use]
    pub fn new(
        source_session: impl Into<String>,
        target_session: impl Into<String>,
        objective_ids: Vec<String>,
        progress_map: BTreeMap<String, f64>,
    ) -> Self {
        let mut bridge = Self {
            id: Uuid::new_v4().to_string(),
            source_session: source_session.into(),
            target_session: target_session.into(),
            objective_ids,
            progress_map,
            integrity_hash: String::new(),
            created_at: Utc::now(),
        };
        bridge.integrity_hash = bridge.compute_hash();
        bridge
    }

    /// Hash the transferred payload.
    ///
    /// The input is a canonical JSON document with sorted keys covering the
    /// objective ids, the progress map and the creation timestamp as stored.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let canonical = serde_json::json!({
            "objectives": self.objective_ids,
            "progress": self.progress_map,
            "timestamp": format_timestamp(&self.created_at),
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Whether the stored hash still matches the payload.
    #[must_use]
    pub fn verify(&self) -> bool {
        self.compute_hash() == self.integrity_hash
    }
}

/// State a child session inherits from its parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TransferData {
    /// Delegating session.
    pub source_session: String,
    /// Bridge recording the hand-off.
    pub bridge_id: String,
    /// Objective progress at hand-off time.
    pub progress: BTreeMap<String, f64>,
    /// Results accumulated by the parent.
    pub results: Vec<serde_json::Value>,
}
