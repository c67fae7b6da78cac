//! Request scoring and admission decisions.
//!
//! A request is scored on three independent axes, each in `[0, 1]`:
//!
//! 1. *clarity*: objective length, vague wording, deliverable and success
//!    criteria.
//! 2. *relevance*: token coverage of the configured primary, secondary and
//!    excluded objectives. Excluded overlap is a veto.
//! 3. *capability readiness*: share of required capability tags that are
//!    available, hard-capped below one half.
//!
//! Sub-scores under `blocking_floor` contribute blocking issues; those
//! between the floor and their threshold contribute warnings.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{debug, info, info_span};

use crate::config::GateConfig;
use crate::models::task::TaskRequest;
use crate::models::validation::{GateStats, ValidationResult};

use super::text;

/// Lower bound on the effort estimate used as the ratio denominator.
const EFFORT_EPSILON: f64 = 0.1;

/// A scored axis with the concerns found while scoring it.
struct Axis {
    label: &'static str,
    score: f64,
    threshold: f64,
    issues: Vec<String>,
    recommendations: Vec<String>,
}

impl Axis {
    fn new(label: &'static str, threshold: f64) -> Self {
        Self {
            label,
            score: 1.0,
            threshold,
            issues: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

/// Admission gate scoring requests against [`GateConfig`] rules.
pub struct ContextGate {
    config: GateConfig,
    registered: HashSet<String>,
    validations: AtomicU64,
    approvals: AtomicU64,
    rejections: AtomicU64,
}

impl ContextGate {
    /// Construct a gate from its scoring rules.
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        let registered = config.capabilities.iter().cloned().collect();
        Self {
            config,
            registered,
            validations: AtomicU64::new(0),
            approvals: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Mark capability tags as always available (e.g. those with a
    /// registered executor).
    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registered.extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Score a request and decide whether it may be scheduled.
    ///
    /// Never fails: a request without objective text is returned as an
    /// invalid result carrying a specific issue.
    #[must_use]
    pub fn validate(&self, request: &TaskRequest) -> ValidationResult {
        let _span = info_span!(
            "validate_task",
            task_id = request.task_id.as_deref().unwrap_or("-"),
        )
        .entered();

        self.validations.fetch_add(1, Ordering::Relaxed);

        if request.objective.trim().is_empty() {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            info!("rejected malformed request without objective text");
            return ValidationResult::malformed(
                "objective text is missing",
                "Describe what the task must achieve in at least a full sentence",
            );
        }

        let cfg = &self.config;
        let (clarity, mut blocking) = self.score_clarity(request);
        let relevance = self.score_relevance(request);
        let (capability, coverage) = self.score_capabilities(request);

        let clarity_score = clarity.score;
        let relevance_score = relevance.score;
        let capability_score = capability.score;

        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();
        for axis in [clarity, relevance, capability] {
            let below_threshold = axis.score < axis.threshold;
            if below_threshold {
                recommendations.extend(axis.recommendations);
            }
            if axis.score < cfg.blocking_floor {
                if axis.issues.is_empty() {
                    blocking.push(format!(
                        "{} score {:.2} is below {:.2}",
                        axis.label, axis.score, cfg.blocking_floor
                    ));
                } else {
                    blocking.extend(axis.issues);
                }
            } else if below_threshold && axis.issues.is_empty() {
                warnings.push(format!(
                    "{} score {:.2} is below the {:.2} threshold",
                    axis.label, axis.score, axis.threshold
                ));
            } else {
                warnings.extend(axis.issues);
            }
        }

        let estimated_effort = self.estimate_effort(request, coverage);
        let estimated_value = self.estimate_value(request, relevance_score);
        let value_effort_ratio = estimated_value / estimated_effort.max(EFFORT_EPSILON);
        if estimated_effort >= cfg.split_effort_hint {
            recommendations.push(format!(
                "Split the task into smaller units (estimated effort {estimated_effort:.1})"
            ));
        }

        let is_valid = blocking.is_empty()
            && clarity_score >= cfg.clarity_threshold
            && relevance_score >= cfg.relevance_threshold
            && capability_score >= cfg.capability_threshold;

        if is_valid {
            self.approvals.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            is_valid,
            clarity = clarity_score,
            relevance = relevance_score,
            capability = capability_score,
            ratio = value_effort_ratio,
            "request scored"
        );
        debug!(?blocking, ?warnings, "validation issues");

        ValidationResult {
            is_valid,
            clarity_score,
            relevance_score,
            capability_score,
            blocking_issues: blocking,
            warnings,
            recommendations,
            estimated_value,
            estimated_effort,
            value_effort_ratio,
            validated_at: Utc::now(),
        }
    }

    /// Running counters since construction.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Counters stay far below 2^52.
    pub fn stats(&self) -> GateStats {
        let validations = self.validations.load(Ordering::Relaxed);
        let approvals = self.approvals.load(Ordering::Relaxed);
        let rejections = self.rejections.load(Ordering::Relaxed);
        let approval_rate = if validations == 0 {
            0.0
        } else {
            approvals as f64 / validations as f64
        };
        GateStats {
            validations,
            approvals,
            rejections,
            approval_rate,
        }
    }

    /// Clarity axis plus issues that block regardless of the score.
    fn score_clarity(&self, request: &TaskRequest) -> (Axis, Vec<String>) {
        let cfg = &self.config;
        let mut axis = Axis::new("clarity", cfg.clarity_threshold);
        let mut hard = Vec::new();
        let words = text::words(&request.objective);

        if words.len() < cfg.min_word_count {
            axis.score -= cfg.short_objective_penalty;
            hard.push(format!(
                "objective is too short ({} words, at least {} required)",
                words.len(),
                cfg.min_word_count
            ));
            axis.recommendations.push(format!(
                "Expand the objective to at least {} words describing the concrete outcome",
                cfg.min_word_count
            ));
        }

        let vague: Vec<&str> = cfg
            .vague_terms
            .iter()
            .filter(|term| text::contains_phrase(&words, term))
            .map(String::as_str)
            .collect();
        for term in &vague {
            axis.score -= cfg.vague_term_penalty;
            axis.issues
                .push(format!("objective uses vague term '{term}'"));
        }
        if !vague.is_empty() {
            axis.recommendations.push(format!(
                "Replace vague wording ({}) with specific actions",
                vague.join(", ")
            ));
        }

        let deliverable_len = request
            .deliverable
            .as_deref()
            .map_or(0, |d| d.trim().chars().count());
        if deliverable_len < cfg.min_deliverable_chars {
            axis.score -= cfg.missing_deliverable_penalty;
            axis.issues
                .push("deliverable is missing or not specific".to_owned());
            axis.recommendations
                .push("Name the concrete deliverable the task hands back".to_owned());
        }

        if request
            .success_criteria
            .iter()
            .all(|criterion| criterion.trim().is_empty())
        {
            axis.score -= cfg.missing_criteria_penalty;
            axis.issues.push("no success criteria given".to_owned());
            axis.recommendations
                .push("Add measurable success criteria".to_owned());
        }

        axis.score = axis.score.clamp(0.0, 1.0);
        (axis, hard)
    }

    fn score_relevance(&self, request: &TaskRequest) -> Axis {
        let cfg = &self.config;
        let mut axis = Axis::new("relevance", cfg.relevance_threshold);

        let mut corpus = request.objective.clone();
        for extra in [request.deliverable.as_deref(), request.business_value.as_deref()]
            .into_iter()
            .flatten()
        {
            corpus.push(' ');
            corpus.push_str(extra);
        }
        for criterion in &request.success_criteria {
            corpus.push(' ');
            corpus.push_str(criterion);
        }
        let candidate = text::tokens(&corpus);

        if let Some((name, overlap)) = best_match(&cfg.excluded_objectives, &candidate) {
            if overlap >= cfg.excluded_veto_overlap {
                axis.score = cfg.excluded_relevance;
                axis.issues
                    .push(format!("task overlaps excluded objective '{name}'"));
                axis.recommendations
                    .push(format!("Drop work related to '{name}'; it is out of scope"));
                return axis;
            }
        }

        if cfg.primary_objectives.is_empty() && cfg.secondary_objectives.is_empty() {
            axis.score = cfg.unconstrained_relevance;
            return axis;
        }

        let primary = best_match(&cfg.primary_objectives, &candidate).map_or(0.0, |(_, o)| o);
        let secondary =
            best_match(&cfg.secondary_objectives, &candidate).map_or(0.0, |(_, o)| o);

        axis.score = if primary >= cfg.primary_strong_overlap {
            cfg.strong_relevance
        } else if primary >= cfg.primary_partial_overlap
            || secondary >= cfg.secondary_strong_overlap
        {
            cfg.partial_relevance
        } else if secondary >= cfg.secondary_weak_overlap {
            cfg.weak_relevance
        } else {
            axis.issues
                .push("task does not align with any configured objective".to_owned());
            cfg.unaligned_relevance
        };

        if axis.score < cfg.relevance_threshold {
            if let Some(first) = cfg.primary_objectives.first() {
                axis.recommendations.push(format!(
                    "Reframe the task in terms of a primary objective such as '{first}'"
                ));
            }
        }
        axis
    }

    /// Capability axis plus the raw coverage used for effort scaling.
    fn score_capabilities(&self, request: &TaskRequest) -> (Axis, f64) {
        let cfg = &self.config;
        let mut axis = Axis::new("capability readiness", cfg.capability_threshold);

        let required: BTreeSet<&str> = request
            .required_capabilities
            .iter()
            .map(String::as_str)
            .collect();
        if required.is_empty() {
            axis.score = cfg.unconstrained_capability;
            return (axis, 1.0);
        }

        let is_available = |tag: &str| {
            self.registered.contains(tag)
                || request.available_capabilities.iter().any(|a| a == tag)
        };

        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|tag| !is_available(*tag))
            .collect();
        #[allow(clippy::cast_precision_loss)] // Tag counts are small.
        let coverage = (required.len() - missing.len()) as f64 / required.len() as f64;

        let mut score = if coverage < 0.5 {
            coverage.min(cfg.capability_hard_cap)
        } else {
            coverage
        };

        let unbacked: Vec<&str> = missing
            .iter()
            .copied()
            .filter(|tag| {
                !request
                    .capability_fallbacks
                    .get(*tag)
                    .is_some_and(|alts| alts.iter().any(|alt| is_available(alt.as_str())))
            })
            .collect();
        if !missing.is_empty() {
            axis.issues
                .push(format!("missing capabilities: {}", missing.join(", ")));
            axis.recommendations.push(format!(
                "Make these capabilities available: {}",
                missing.join(", ")
            ));
        }
        if !unbacked.is_empty() {
            score -= cfg.missing_fallback_penalty;
            axis.recommendations.push(format!(
                "Declare an available fallback for: {}",
                unbacked.join(", ")
            ));
        }

        axis.score = score.clamp(0.0, 1.0);
        (axis, coverage)
    }

    /// Effort grows with complexity keywords and with capability scarcity.
    #[allow(clippy::cast_precision_loss)] // Keyword counts are small.
    fn estimate_effort(&self, request: &TaskRequest, coverage: f64) -> f64 {
        let cfg = &self.config;
        let words = text::words(&request.objective);
        let keywords = cfg
            .complexity_keywords
            .iter()
            .filter(|kw| text::contains_phrase(&words, kw))
            .count();
        let complexity = 1.0 + cfg.complexity_step * keywords as f64;
        let scarcity = 1.0 + (1.0 - coverage.clamp(0.0, 1.0));
        cfg.base_effort * complexity * scarcity
    }

    /// Mean impact (or the default) weighted by relevance.
    #[allow(clippy::cast_precision_loss)] // Assessment counts are small.
    fn estimate_value(&self, request: &TaskRequest, relevance: f64) -> f64 {
        let impact = if request.impact_assessment.is_empty() {
            self.config.default_impact
        } else {
            let sum: f64 = request
                .impact_assessment
                .values()
                .map(|v| v.clamp(0.0, 1.0))
                .sum();
            sum / request.impact_assessment.len() as f64
        };
        impact * relevance
    }
}

/// Highest token coverage of any objective in `set` by `candidate`.
fn best_match<'a>(set: &'a [String], candidate: &BTreeSet<String>) -> Option<(&'a str, f64)> {
    set.iter()
        .map(|objective| {
            (
                objective.as_str(),
                text::coverage(&text::tokens(objective), candidate),
            )
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
}
