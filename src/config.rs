//! Global configuration parsing and validation.
//!
//! Every section is optional; omitted values fall back to the defaults
//! below. Scoring constants used by the admission gate live here too so
//! they can be tuned per deployment.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// Admission gate scoring rules.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct GateConfig {
    /// Minimum number of words in the objective text.
    pub min_word_count: usize,
    /// Minimum number of characters for a deliverable to count as specific.
    pub min_deliverable_chars: usize,
    /// Terms that mark an objective as vague (matched case-insensitively).
    pub vague_terms: Vec<String>,
    /// Penalty applied when the objective is below `min_word_count`.
    pub short_objective_penalty: f64,
    /// Penalty applied per vague term found.
    pub vague_term_penalty: f64,
    /// Penalty applied when the deliverable is missing or unspecific.
    pub missing_deliverable_penalty: f64,
    /// Penalty applied when no success criteria are given.
    pub missing_criteria_penalty: f64,
    /// Objectives the project primarily pursues.
    pub primary_objectives: Vec<String>,
    /// Objectives of secondary importance.
    pub secondary_objectives: Vec<String>,
    /// Objectives that must never be worked on.
    pub excluded_objectives: Vec<String>,
    /// Overlap with an excluded objective at or above this vetoes the task.
    pub excluded_veto_overlap: f64,
    /// Primary overlap at or above this counts as strong alignment.
    pub primary_strong_overlap: f64,
    /// Primary overlap at or above this counts as partial alignment.
    pub primary_partial_overlap: f64,
    /// Secondary overlap at or above this counts as strong alignment.
    pub secondary_strong_overlap: f64,
    /// Secondary overlap at or above this counts as weak alignment.
    pub secondary_weak_overlap: f64,
    /// Relevance for strong primary alignment.
    pub strong_relevance: f64,
    /// Relevance for partial primary or strong secondary alignment.
    pub partial_relevance: f64,
    /// Relevance for weak secondary alignment.
    pub weak_relevance: f64,
    /// Relevance when nothing aligns.
    pub unaligned_relevance: f64,
    /// Relevance after an excluded-objective veto.
    pub excluded_relevance: f64,
    /// Relevance when no primary or secondary objectives are configured.
    pub unconstrained_relevance: f64,
    /// Clarity score required for a valid task.
    pub clarity_threshold: f64,
    /// Relevance score required for a valid task.
    pub relevance_threshold: f64,
    /// Capability-readiness score required for a valid task.
    pub capability_threshold: f64,
    /// Any sub-score below this floor becomes a blocking issue.
    pub blocking_floor: f64,
    /// Ceiling on capability readiness when under half the required tags are available.
    pub capability_hard_cap: f64,
    /// Capability readiness of a request that requires nothing.
    pub unconstrained_capability: f64,
    /// Penalty for missing capabilities that have no available fallback.
    pub missing_fallback_penalty: f64,
    /// Capabilities always considered available.
    pub capabilities: Vec<String>,
    /// Keywords that raise the effort estimate.
    pub complexity_keywords: Vec<String>,
    /// Effort of a task with no complexity keywords and full capability coverage.
    pub base_effort: f64,
    /// Effort multiplier added per complexity keyword present.
    pub complexity_step: f64,
    /// Impact assumed when the request carries no impact assessment.
    pub default_impact: f64,
    /// Effort above which the gate recommends splitting the task.
    pub split_effort_hint: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_word_count: 10,
            min_deliverable_chars: 10,
            vague_terms: vec![
                "algo".into(),
                "cosa".into(),
                "mejorar".into(),
                "analizar genéricamente".into(),
                "something".into(),
                "stuff".into(),
            ],
            short_objective_penalty: 0.3,
            vague_term_penalty: 0.2,
            missing_deliverable_penalty: 0.4,
            missing_criteria_penalty: 0.3,
            primary_objectives: Vec::new(),
            secondary_objectives: Vec::new(),
            excluded_objectives: Vec::new(),
            excluded_veto_overlap: 0.5,
            primary_strong_overlap: 0.6,
            primary_partial_overlap: 0.3,
            secondary_strong_overlap: 0.5,
            secondary_weak_overlap: 0.3,
            strong_relevance: 0.9,
            partial_relevance: 0.7,
            weak_relevance: 0.5,
            unaligned_relevance: 0.2,
            excluded_relevance: 0.05,
            unconstrained_relevance: 1.0,
            clarity_threshold: 0.7,
            relevance_threshold: 0.6,
            capability_threshold: 0.7,
            blocking_floor: 0.5,
            capability_hard_cap: 0.2,
            unconstrained_capability: 1.0,
            missing_fallback_penalty: 0.2,
            capabilities: Vec::new(),
            complexity_keywords: vec![
                "modelo".into(),
                "predicción".into(),
                "dashboard".into(),
                "model".into(),
                "prediction".into(),
            ],
            base_effort: 1.0,
            complexity_step: 0.5,
            default_impact: 0.7,
            split_effort_hint: 4.0,
        }
    }
}

/// Worker pool sizing, cadence, and health ceilings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct SchedulerConfig {
    /// Agents spawned when the scheduler starts.
    pub min_agents: usize,
    /// Hard ceiling on live agents.
    pub max_agents: usize,
    /// Interval between dispatch cycles.
    pub cycle_interval_ms: u64,
    /// Resident memory ceiling for the process.
    pub max_memory_mb: f64,
    /// CPU usage ceiling for the process.
    pub max_cpu_percent: f32,
    /// Per-task execution timeout; 0 disables it.
    pub task_timeout_seconds: u64,
    /// Bounded wait for in-flight tasks during shutdown.
    pub shutdown_timeout_seconds: u64,
    /// Consecutive failures after which an agent is paused; 0 never pauses.
    pub pause_after_failures: u32,
    /// Finished tasks kept for lookups and dependency checks before the
    /// oldest are evicted.
    pub task_history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_agents: 3,
            max_agents: 12,
            cycle_interval_ms: 1000,
            max_memory_mb: 2048.0,
            max_cpu_percent: 90.0,
            task_timeout_seconds: 0,
            shutdown_timeout_seconds: 30,
            pause_after_failures: 3,
            task_history_limit: 1000,
        }
    }
}

/// Context budget and delegation policy.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    /// Budget each session may consume.
    pub budget_limit: u64,
    /// Consumed/limit ratio at which delegation triggers.
    pub delegation_threshold: f64,
    /// Deepest genealogy level a delegation may create.
    pub max_depth: u32,
    /// Budget charged for a task that does not declare its own cost.
    pub default_task_cost: u64,
    /// Progress credited to each contributing objective per successful task.
    pub progress_increment: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            budget_limit: 950_000,
            delegation_threshold: 0.85,
            max_depth: 8,
            default_task_cost: 1000,
            progress_increment: 0.1,
        }
    }
}

/// Checkpoint storage policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct PersistenceConfig {
    /// Context snapshots larger than this are gzip-compressed.
    pub compression_threshold_bytes: usize,
    /// Interval between automatic checkpoints; 0 disables them.
    pub checkpoint_interval_seconds: u64,
    /// Extra attempts for a failed checkpoint write.
    pub write_retries: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: 1024,
            checkpoint_interval_seconds: 300,
            write_retries: 2,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("context-relay.db")
}

fn default_retention_days() -> u32 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Days after which checkpoints become eligible for cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Admission gate scoring rules.
    #[serde(default)]
    pub gate: GateConfig,
    /// Worker pool settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Budget and delegation policy.
    #[serde(default)]
    pub session: SessionConfig,
    /// Checkpoint storage policy.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Capability tag to shell command used by the command executor.
    #[serde(default)]
    pub executors: HashMap<String, String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: default_retention_days(),
            gate: GateConfig::default(),
            scheduler: SchedulerConfig::default(),
            session: SessionConfig::default(),
            persistence: PersistenceConfig::default(),
            executors: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let sched = &self.scheduler;
        if sched.max_agents == 0 {
            return Err(AppError::Config(
                "scheduler.max_agents must be greater than zero".into(),
            ));
        }
        if sched.min_agents > sched.max_agents {
            return Err(AppError::Config(format!(
                "scheduler.min_agents ({}) exceeds max_agents ({})",
                sched.min_agents, sched.max_agents
            )));
        }
        if sched.task_history_limit == 0 {
            return Err(AppError::Config(
                "scheduler.task_history_limit must be greater than zero".into(),
            ));
        }
        if sched.cycle_interval_ms == 0 {
            return Err(AppError::Config(
                "scheduler.cycle_interval_ms must be greater than zero".into(),
            ));
        }

        let session = &self.session;
        if session.budget_limit == 0 {
            return Err(AppError::Config(
                "session.budget_limit must be greater than zero".into(),
            ));
        }
        if !(session.delegation_threshold > 0.0 && session.delegation_threshold <= 1.0) {
            return Err(AppError::Config(
                "session.delegation_threshold must be within (0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&session.progress_increment) {
            return Err(AppError::Config(
                "session.progress_increment must be within [0, 1]".into(),
            ));
        }

        let gate = &self.gate;
        for (name, value) in [
            ("clarity_threshold", gate.clarity_threshold),
            ("relevance_threshold", gate.relevance_threshold),
            ("capability_threshold", gate.capability_threshold),
            ("blocking_floor", gate.blocking_floor),
            ("default_impact", gate.default_impact),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AppError::Config(format!(
                    "gate.{name} must be within [0, 1]"
                )));
            }
        }
        if gate.base_effort <= 0.0 {
            return Err(AppError::Config(
                "gate.base_effort must be positive".into(),
            ));
        }

        Ok(())
    }
}
