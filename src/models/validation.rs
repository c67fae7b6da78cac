//! Admission gate results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of scoring a [`TaskRequest`](super::task::TaskRequest).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ValidationResult {
    /// Whether the request may enter the scheduler.
    pub is_valid: bool,
    /// How well-specified the objective is, in `[0, 1]`.
    pub clarity_score: f64,
    /// Alignment with the configured objective sets, in `[0, 1]`.
    pub relevance_score: f64,
    /// Share of required capabilities available, in `[0, 1]`.
    pub capability_score: f64,
    /// Issues that make the request invalid.
    pub blocking_issues: Vec<String>,
    /// Non-fatal concerns.
    pub warnings: Vec<String>,
    /// Suggested improvements for the caller.
    pub recommendations: Vec<String>,
    /// Estimated value in `[0, 1]`.
    pub estimated_value: f64,
    /// Estimated effort in abstract units.
    pub estimated_effort: f64,
    /// `estimated_value / max(estimated_effort, ε)`.
    pub value_effort_ratio: f64,
    /// When the request was scored.
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    /// A rejection for a request that cannot be scored at all.
    #[must_use]
    pub fn malformed(issue: impl Into<String>, recommendation: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            clarity_score: 0.0,
            relevance_score: 0.0,
            capability_score: 0.0,
            blocking_issues: vec![issue.into()],
            warnings: Vec::new(),
            recommendations: vec![recommendation.into()],
            estimated_value: 0.0,
            estimated_effort: 0.0,
            value_effort_ratio: 0.0,
            validated_at: Utc::now(),
        }
    }
}

/// Running counters kept by the gate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GateStats {
    /// Requests scored.
    pub validations: u64,
    /// Requests admitted.
    pub approvals: u64,
    /// Requests rejected.
    pub rejections: u64,
    /// `approvals / validations`, or 0 before the first validation.
    pub approval_rate: f64,
}
