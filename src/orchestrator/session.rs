//! Context budget tracking and session delegation.
//!
//! A [`SessionOrchestrator`] owns one node of the session genealogy. It
//! charges task costs against the session's budget and, once the
//! configured share is consumed, hands the remaining objectives to a child
//! session one level down. Objective progress lives in the store and only
//! ever rises, so it survives every hand-off.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SessionConfig;
use crate::models::bridge::TransferData;
use crate::models::checkpoint::{CheckpointSnapshot, CheckpointType};
use crate::models::objective::GlobalObjective;
use crate::models::session::{SessionContext, SessionStatus};
use crate::models::task::Priority;
use crate::persistence::db::Database;
use crate::persistence::objective_repo::ObjectiveRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};

use super::checkpoint_store::CheckpointStore;

/// Result of charging usage against the session budget.
#[derive(Debug)]
pub enum UsageOutcome {
    /// Usage stays below the delegation threshold.
    WithinBudget,
    /// The threshold was reached and a child session took over.
    Delegated(Box<SessionOrchestrator>),
    /// The threshold was reached but delegation failed; the session stays
    /// active and retries on the next charge.
    DelegationFailed(String),
    /// The session is no longer active; nothing was charged.
    Inactive,
}

/// Progress and budget view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// The session record.
    pub session: SessionContext,
    /// Objectives bound to the session.
    pub objectives: Vec<GlobalObjective>,
    /// Mean progress over every global objective.
    pub global_progress: f64,
    /// Task results accumulated in this session (inherited ones included).
    pub results_recorded: usize,
}

/// Delegation steps already carried out by a failed attempt.
#[derive(Default)]
struct PendingDelegation {
    checkpoint_id: Option<String>,
    child: Option<SessionContext>,
    bridge_id: Option<String>,
    child_persisted: bool,
}

/// Budget-tracking owner of one session.
pub struct SessionOrchestrator {
    config: SessionConfig,
    db: Arc<Database>,
    store: CheckpointStore,
    sessions: SessionRepo,
    objectives: ObjectiveRepo,
    context: SessionContext,
    results: Vec<serde_json::Value>,
    pending: Option<PendingDelegation>,
}

impl fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("session_id", &self.context.id)
            .field("status", &self.context.status)
            .field("depth", &self.context.depth)
            .field("consumed_budget", &self.context.consumed_budget)
            .field("results", &self.results.len())
            .field("delegation_pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    fn assemble(
        db: Arc<Database>,
        store: CheckpointStore,
        config: SessionConfig,
        context: SessionContext,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(Arc::clone(&db)),
            objectives: ObjectiveRepo::new(Arc::clone(&db)),
            config,
            db,
            store,
            context,
            results: Vec::new(),
            pending: None,
        }
    }

    /// Start a session bound to every currently active objective.
    ///
    /// With a `parent` the session is created one level below it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Delegation` if the parent is already at the
    /// maximum depth, or `AppError::Db` if the session cannot be persisted.
    pub async fn start(
        db: Arc<Database>,
        store: CheckpointStore,
        config: SessionConfig,
        parent: Option<&SessionContext>,
    ) -> Result<Self> {
        let objective_ids = ObjectiveRepo::new(Arc::clone(&db))
            .list_active()
            .await?
            .into_iter()
            .map(|o| o.id)
            .collect();

        let context = match parent {
            None => SessionContext::new(objective_ids, config.budget_limit),
            Some(parent) => {
                if parent.depth >= config.max_depth {
                    return Err(AppError::Delegation(format!(
                        "maximum session depth {} reached",
                        config.max_depth
                    )));
                }
                SessionContext::child_of(parent, objective_ids, config.budget_limit)
            }
        };

        let orchestrator = Self::assemble(db, store, config, context);
        orchestrator.sessions.create(&orchestrator.context).await?;
        info!(
            session_id = %orchestrator.context.id,
            level = ?orchestrator.context.level,
            objectives = orchestrator.context.objective_ids.len(),
            "session started"
        );
        Ok(orchestrator)
    }

    /// Reload a persisted active session and replay the results captured by
    /// its newest checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::Delegation` if it already reached a terminal state, or
    /// `AppError::Db` / `AppError::Codec` if it cannot be read.
    pub async fn resume(
        db: Arc<Database>,
        store: CheckpointStore,
        config: SessionConfig,
        session_id: &str,
    ) -> Result<Self> {
        let context = SessionRepo::new(Arc::clone(&db))
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        if !context.is_active() {
            return Err(AppError::Delegation(format!(
                "session {session_id} is {} and cannot resume",
                context.status
            )));
        }

        let latest = store.latest_for_session(session_id).await?;
        let mut orchestrator = Self::assemble(db, store, config, context);
        if let Some(checkpoint) = latest {
            if let serde_json::Value::Array(results) = checkpoint.snapshot.results {
                orchestrator.results = results;
            }
            info!(
                session_id,
                checkpoint_id = %checkpoint.id,
                results = orchestrator.results.len(),
                "session resumed from checkpoint"
            );
        } else {
            info!(session_id, "session resumed without checkpoint");
        }
        Ok(orchestrator)
    }

    /// The session record.
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Results accumulated in this session.
    #[must_use]
    pub fn results(&self) -> &[serde_json::Value] {
        &self.results
    }

    /// Append an opaque task result.
    pub fn record_result(&mut self, result: serde_json::Value) {
        self.results.push(result);
    }

    /// Charge `delta` against the budget and delegate once the threshold
    /// is reached.
    ///
    /// Usage is never rolled back: if delegation fails the session keeps
    /// running over budget and retries on the next call.
    pub async fn monitor_usage(&mut self, delta: u64) -> UsageOutcome {
        if !self.context.is_active() {
            return UsageOutcome::Inactive;
        }

        self.context.consumed_budget = self.context.consumed_budget.saturating_add(delta);
        if let Err(err) = self.sessions.update(&self.context).await {
            warn!(session_id = %self.context.id, %err, "failed to persist budget usage");
        }

        let ratio = self.context.usage_ratio();
        if ratio < self.config.delegation_threshold {
            return UsageOutcome::WithinBudget;
        }

        match self.delegate("context budget threshold reached").await {
            Ok(child) => UsageOutcome::Delegated(Box::new(child)),
            Err(err) => {
                warn!(
                    session_id = %self.context.id,
                    consumed = self.context.consumed_budget,
                    limit = self.context.budget_limit,
                    %err,
                    "delegation failed; session continues over budget"
                );
                UsageOutcome::DelegationFailed(err.to_string())
            }
        }
    }

    /// Hand the remaining objectives to a new child session.
    ///
    /// In order: a pre-delegation checkpoint, a continuity bridge, the
    /// persisted child session, the child inheriting progress and results,
    /// and finally this session marked delegated. Steps completed by an
    /// earlier failed attempt are reused, so a successful delegation leaves
    /// exactly one checkpoint and one bridge.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Delegation` if the session is not active or the
    /// maximum depth is reached, or the persistence error that stopped the
    /// hand-off. The session stays active in every error case.
    pub async fn delegate(&mut self, reason: &str) -> Result<SessionOrchestrator> {
        let span = info_span!("delegate", session_id = %self.context.id, reason);
        self.delegate_inner(reason).instrument(span).await
    }

    async fn delegate_inner(&mut self, reason: &str) -> Result<SessionOrchestrator> {
        if !self.context.is_active() {
            return Err(AppError::Delegation(format!(
                "session {} is {}",
                self.context.id, self.context.status
            )));
        }
        if self.context.depth >= self.config.max_depth {
            return Err(AppError::Delegation(format!(
                "maximum session depth {} reached",
                self.config.max_depth
            )));
        }

        let objectives = self.objectives.get_many(&self.context.objective_ids).await?;
        let progress: BTreeMap<String, f64> = objectives
            .iter()
            .map(|o| (o.id.clone(), o.progress))
            .collect();
        let mut pending = self.pending.take().unwrap_or_default();

        let result = self
            .run_delegation(reason, &objectives, &progress, &mut pending)
            .await;
        match result {
            Ok(child) => Ok(child),
            Err(err) => {
                self.pending = Some(pending);
                Err(err)
            }
        }
    }

    async fn run_delegation(
        &mut self,
        reason: &str,
        objectives: &[GlobalObjective],
        progress: &BTreeMap<String, f64>,
        pending: &mut PendingDelegation,
    ) -> Result<SessionOrchestrator> {
        // ── 1. Pre-delegation checkpoint ───────────────────
        let checkpoint_id = match &pending.checkpoint_id {
            Some(id) => id.clone(),
            None => {
                let snapshot = self.snapshot(objectives, Some(reason), None)?;
                let id = self
                    .store
                    .create_checkpoint(&self.context.id, CheckpointType::PreDelegation, snapshot)
                    .await?;
                pending.checkpoint_id = Some(id.clone());
                id
            }
        };

        // ── 2. Continuity bridge to the child ──────────────
        let transferred: Vec<String> = objectives
            .iter()
            .filter(|o| !o.is_completed())
            .map(|o| o.id.clone())
            .collect();
        let child_context = pending
            .child
            .get_or_insert_with(|| {
                SessionContext::child_of(&self.context, transferred.clone(), self.config.budget_limit)
            })
            .clone();
        let bridge_id = match &pending.bridge_id {
            Some(id) => id.clone(),
            None => {
                let transferred_progress = transferred
                    .iter()
                    .filter_map(|id| progress.get(id).map(|p| (id.clone(), *p)))
                    .collect();
                let bridge = self
                    .store
                    .create_continuity_bridge(
                        &self.context.id,
                        &child_context.id,
                        child_context.objective_ids.clone(),
                        transferred_progress,
                    )
                    .await?;
                pending.bridge_id = Some(bridge.id.clone());
                bridge.id
            }
        };

        // ── 3. Child session one level down ────────────────
        if !pending.child_persisted {
            self.sessions.create(&child_context).await?;
            pending.child_persisted = true;
        }
        let mut child = Self::assemble(
            Arc::clone(&self.db),
            self.store.clone(),
            self.config.clone(),
            child_context,
        );

        // ── 4. Child inherits progress and results ─────────
        let transfer = TransferData {
            source_session: self.context.id.clone(),
            bridge_id: bridge_id.clone(),
            progress: progress.clone(),
            results: self.results.clone(),
        };
        child.inherit(&transfer).await?;

        // ── 5. Parent becomes delegated ────────────────────
        let mut delegated = self.context.clone();
        delegated.status = SessionStatus::Delegated;
        delegated.child_ids.push(child.context.id.clone());
        self.sessions.update(&delegated).await?;
        self.context = delegated;

        info!(
            child_id = %child.context.id,
            checkpoint_id = %checkpoint_id,
            bridge_id = %bridge_id,
            depth = child.context.depth,
            "session delegated"
        );
        Ok(child)
    }

    /// Seed this session from its parent's hand-off.
    ///
    /// Each objective's progress becomes the larger of its stored and
    /// inherited value. Inherited results are prepended to local ones.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a progress update fails.
    pub async fn inherit(&mut self, transfer: &TransferData) -> Result<()> {
        for (objective_id, inherited) in &transfer.progress {
            match self.objectives.raise_progress(objective_id, *inherited).await {
                Ok(_) => {}
                Err(AppError::NotFound(_)) => {
                    warn!(objective_id, "inherited progress for unknown objective");
                }
                Err(err) => return Err(err),
            }
        }
        let mut results = transfer.results.clone();
        results.append(&mut self.results);
        self.results = results;
        info!(
            session_id = %self.context.id,
            source = %transfer.source_session,
            bridge_id = %transfer.bridge_id,
            objectives = transfer.progress.len(),
            "session inherited state"
        );
        Ok(())
    }

    /// Raise an objective's progress to `value` if higher.
    ///
    /// When every objective bound to an active session is complete the
    /// session itself completes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown objective or
    /// `AppError::Db` if the update fails.
    pub async fn update_objective_progress(
        &mut self,
        objective_id: &str,
        value: f64,
    ) -> Result<GlobalObjective> {
        let updated = self.objectives.raise_progress(objective_id, value).await?;
        if updated.is_completed() {
            info!(objective_id, "objective completed");
        }
        self.complete_if_done().await?;
        Ok(updated)
    }

    /// Add `increment` to an objective's current progress.
    ///
    /// # Errors
    ///
    /// Same as [`update_objective_progress`](Self::update_objective_progress).
    pub async fn advance_objective(
        &mut self,
        objective_id: &str,
        increment: f64,
    ) -> Result<GlobalObjective> {
        let current = self
            .objectives
            .get_by_id(objective_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("objective {objective_id} not found")))?;
        self.update_objective_progress(objective_id, current.progress + increment)
            .await
    }

    async fn complete_if_done(&mut self) -> Result<()> {
        if !self.context.is_active() || self.context.objective_ids.is_empty() {
            return Ok(());
        }
        let bound = self.objectives.get_many(&self.context.objective_ids).await?;
        if bound.len() == self.context.objective_ids.len()
            && bound.iter().all(GlobalObjective::is_completed)
        {
            self.context.status = SessionStatus::Completed;
            self.sessions.update(&self.context).await?;
            info!(session_id = %self.context.id, "all session objectives completed");
        }
        Ok(())
    }

    /// Create and persist a global objective, binding it to this session
    /// while the session is active.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a write fails.
    pub async fn create_objective(
        &mut self,
        name: &str,
        priority: Priority,
        target_metrics: HashMap<String, f64>,
        completion_criteria: Vec<String>,
    ) -> Result<GlobalObjective> {
        let objective = self
            .objectives
            .create(&GlobalObjective::new(
                name,
                priority,
                target_metrics,
                completion_criteria,
            ))
            .await?;
        if self.context.is_active() {
            self.context.objective_ids.push(objective.id.clone());
            self.sessions.update(&self.context).await?;
        }
        info!(objective_id = %objective.id, name, "objective created");
        Ok(objective)
    }

    /// Mean progress over all global objectives; 0 when there are none.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    #[allow(clippy::cast_precision_loss)] // Objective counts are small.
    pub async fn global_progress(&self) -> Result<f64> {
        let all = self.objectives.list_all().await?;
        if all.is_empty() {
            return Ok(0.0);
        }
        Ok(all.iter().map(|o| o.progress).sum::<f64>() / all.len() as f64)
    }

    /// Snapshot the session into a checkpoint of the given type.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Codec` if the write fails.
    pub async fn checkpoint_now(
        &self,
        checkpoint_type: CheckpointType,
        agent_states: Option<serde_json::Value>,
    ) -> Result<String> {
        let objectives = self.objectives.get_many(&self.context.objective_ids).await?;
        let snapshot = self.snapshot(&objectives, None, agent_states)?;
        self.store
            .create_checkpoint(&self.context.id, checkpoint_type, snapshot)
            .await
    }

    /// Progress and budget report.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn report(&self) -> Result<SessionReport> {
        Ok(SessionReport {
            session: self.context.clone(),
            objectives: self.objectives.get_many(&self.context.objective_ids).await?,
            global_progress: self.global_progress().await?,
            results_recorded: self.results.len(),
        })
    }

    fn snapshot(
        &self,
        objectives: &[GlobalObjective],
        reason: Option<&str>,
        agent_states: Option<serde_json::Value>,
    ) -> Result<CheckpointSnapshot> {
        Ok(CheckpointSnapshot {
            context: serde_json::json!({
                "session": self.context,
                "reason": reason,
            }),
            objectives: serde_json::to_value(objectives)?,
            results: serde_json::Value::Array(self.results.clone()),
            agent_states,
        })
    }
}
