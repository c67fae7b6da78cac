//! End-to-end task pipeline.
//!
//! [`Relay`] wires the gate, scheduler, checkpoint store and session
//! orchestrator together and exposes the collaborator-facing surface:
//! [`submit_task`](Relay::submit_task),
//! [`get_session_status`](Relay::get_session_status) and
//! [`get_continuity_metrics`](Relay::get_continuity_metrics).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::gate::ContextGate;
use crate::models::checkpoint::CheckpointType;
use crate::models::objective::GlobalObjective;
use crate::models::recovery::ContinuityMetrics;
use crate::models::task::{Priority, Task, TaskRequest, TaskStatus};
use crate::models::validation::{GateStats, ValidationResult};
use crate::persistence::db::Database;
use crate::persistence::retention;
use crate::scheduler::executor::ExecutorRegistry;
use crate::scheduler::health::HealthProbe;
use crate::scheduler::pool::{Scheduler, SchedulerSnapshot, ShutdownReport};
use crate::{AppError, GlobalConfig, Result};

use super::checkpoint_store::CheckpointStore;
use super::session::{SessionOrchestrator, SessionReport, UsageOutcome};

/// Answer to a submitted request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// The request passed the gate and was executed.
    Approved {
        /// Scheduled task id.
        task_id: String,
        /// Final task status.
        status: TaskStatus,
        /// Opaque result on success.
        result: Option<serde_json::Value>,
        /// Failure description.
        error: Option<String>,
        /// Gate scoring.
        validation: ValidationResult,
        /// Child session that took over, if this task triggered delegation.
        delegated_to: Option<String>,
    },
    /// The request was refused before consuming capacity.
    Rejected {
        /// Why the request was refused.
        issues: Vec<String>,
        /// How to make it acceptable.
        recommendations: Vec<String>,
        /// Gate scoring of the request.
        validation: ValidationResult,
    },
}

impl SubmitOutcome {
    /// Whether the request was admitted.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

/// Combined status view.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    /// Current session progress and budget.
    pub session: SessionReport,
    /// Scheduler queues and agent metrics.
    pub scheduler: SchedulerSnapshot,
    /// Gate counters.
    pub gate: GateStats,
}

/// The assembled orchestration pipeline.
pub struct Relay {
    config: Arc<GlobalConfig>,
    gate: ContextGate,
    store: CheckpointStore,
    scheduler: Scheduler,
    session: Arc<Mutex<SessionOrchestrator>>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    /// Start a new root session and the background loops.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the session cannot be persisted.
    pub async fn start(
        config: GlobalConfig,
        db: Arc<Database>,
        executors: ExecutorRegistry,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        let store = CheckpointStore::new(Arc::clone(&db), &config.persistence);
        let session = SessionOrchestrator::start(
            Arc::clone(&db),
            store.clone(),
            config.session.clone(),
            None,
        )
        .await?;
        Ok(Self::assemble(config, db, store, session, executors, probe))
    }

    /// Resume a persisted active session and start the background loops.
    ///
    /// # Errors
    ///
    /// See [`SessionOrchestrator::resume`].
    pub async fn resume(
        config: GlobalConfig,
        db: Arc<Database>,
        executors: ExecutorRegistry,
        probe: Arc<dyn HealthProbe>,
        session_id: &str,
    ) -> Result<Self> {
        let store = CheckpointStore::new(Arc::clone(&db), &config.persistence);
        let session = SessionOrchestrator::resume(
            Arc::clone(&db),
            store.clone(),
            config.session.clone(),
            session_id,
        )
        .await?;
        Ok(Self::assemble(config, db, store, session, executors, probe))
    }

    fn assemble(
        config: GlobalConfig,
        db: Arc<Database>,
        store: CheckpointStore,
        session: SessionOrchestrator,
        executors: ExecutorRegistry,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let gate = ContextGate::new(config.gate.clone()).with_capabilities(executors.capabilities());
        let scheduler = Scheduler::new(config.scheduler.clone(), executors, probe);
        let session = Arc::new(Mutex::new(session));
        let cancel = CancellationToken::new();

        let mut background = vec![
            scheduler.spawn_dispatch_loop(cancel.clone()),
            retention::spawn_retention_task(db, config.retention_days, cancel.clone()),
        ];
        if config.persistence.checkpoint_interval_seconds > 0 {
            background.push(spawn_periodic_checkpoints(
                Arc::clone(&session),
                scheduler.clone(),
                Duration::from_secs(config.persistence.checkpoint_interval_seconds),
                cancel.clone(),
            ));
        }

        Self {
            config: Arc::new(config),
            gate,
            store,
            scheduler,
            session,
            cancel,
            background: Mutex::new(background),
        }
    }

    /// The checkpoint store backing this pipeline.
    #[must_use]
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// The scheduler executing admitted tasks.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Id of the session currently charged for work.
    pub async fn session_id(&self) -> String {
        self.session.lock().await.context().id.clone()
    }

    /// Run a request through the full pipeline.
    ///
    /// Validation rejections and unsatisfiable dependencies come back as
    /// [`SubmitOutcome::Rejected`]; task failures come back as an approved
    /// outcome with a failed status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Execution` if the bound session has completed,
    /// if the scheduler refuses the task for a reason other than its
    /// dependencies (for example during shutdown), or if it loses track of
    /// the task.
    pub async fn submit_task(&self, request: TaskRequest) -> Result<SubmitOutcome> {
        let span = info_span!(
            "submit_task",
            task_id = request.task_id.as_deref().unwrap_or("-"),
        );
        self.submit_inner(request).instrument(span).await
    }

    async fn submit_inner(&self, request: TaskRequest) -> Result<SubmitOutcome> {
        {
            let session = self.session.lock().await;
            let context = session.context();
            if !context.is_active() {
                warn!(session_id = %context.id, status = %context.status, "submission refused");
                return Err(AppError::Execution(format!(
                    "session {} is {}; start a new session to submit more work",
                    context.id, context.status
                )));
            }
        }

        // ── 1. Admission ───────────────────────────────────
        let validation = self.gate.validate(&request);
        if !validation.is_valid {
            info!(issues = validation.blocking_issues.len(), "request rejected");
            return Ok(SubmitOutcome::Rejected {
                issues: validation.blocking_issues.clone(),
                recommendations: validation.recommendations.clone(),
                validation,
            });
        }

        // ── 2. Pre-task checkpoint ─────────────────────────
        self.checkpoint_with_retry(CheckpointType::Automatic).await;

        // ── 3. Enqueue and dispatch ────────────────────────
        let task = Task::from_request(&request);
        let task_id = match self.scheduler.enqueue(task).await {
            Ok(id) => id,
            Err(AppError::Dependency(issue)) => {
                info!(%issue, "request rejected: dependency can never complete");
                return Ok(SubmitOutcome::Rejected {
                    issues: vec![issue],
                    recommendations: vec![
                        "Submit the task after its dependencies are queued, or drop failed dependencies"
                            .to_owned(),
                    ],
                    validation,
                });
            }
            Err(err) => return Err(err),
        };
        self.scheduler.run_cycle().await;

        // ── 4. Await outcome ───────────────────────────────
        let finished = self.scheduler.wait_for(&task_id).await?;
        let succeeded = finished.status == TaskStatus::Completed;

        let delegated_to = {
            let mut session = self.session.lock().await;
            if let Some(result) = &finished.result {
                session.record_result(serde_json::json!({
                    "task_id": finished.id,
                    "result": result,
                }));
            }
            drop(session);

            // ── 5. Post-task checkpoints ───────────────────
            self.checkpoint_with_retry(CheckpointType::Milestone).await;
            if !succeeded && request.priority == Priority::Critical {
                warn!(task_id = %finished.id, "critical task failed");
                self.checkpoint_with_retry(CheckpointType::ErrorRecovery).await;
            }

            // ── 6. Objective progress ──────────────────────
            let mut session = self.session.lock().await;
            if succeeded {
                for objective_id in &request.objective_ids {
                    if let Err(err) = session
                        .advance_objective(objective_id, self.config.session.progress_increment)
                        .await
                    {
                        warn!(objective_id, %err, "failed to advance objective");
                    }
                }
            }

            // ── 7. Budget ──────────────────────────────────
            let cost = request
                .budget_cost
                .unwrap_or(self.config.session.default_task_cost);
            match session.monitor_usage(cost).await {
                UsageOutcome::Delegated(child) => {
                    let child_id = child.context().id.clone();
                    *session = *child;
                    Some(child_id)
                }
                UsageOutcome::WithinBudget
                | UsageOutcome::DelegationFailed(_)
                | UsageOutcome::Inactive => None,
            }
        };

        Ok(SubmitOutcome::Approved {
            task_id: finished.id,
            status: finished.status,
            result: finished.result,
            error: finished.error,
            validation,
            delegated_to,
        })
    }

    /// Take a checkpoint of the current session, retrying failed writes.
    ///
    /// Gives up after `write_retries` extra attempts; task execution never
    /// waits on a checkpoint that cannot be written.
    async fn checkpoint_with_retry(&self, checkpoint_type: CheckpointType) -> Option<String> {
        let agent_states = serde_json::to_value(self.scheduler.snapshot().await.agents).ok();
        let attempts = self.config.persistence.write_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let outcome = self
                .session
                .lock()
                .await
                .checkpoint_now(checkpoint_type, agent_states.clone())
                .await;
            match outcome {
                Ok(id) => return Some(id),
                Err(err) if attempt < attempts => {
                    warn!(%err, attempt, kind = %checkpoint_type, "checkpoint write failed; retrying");
                }
                Err(err) => {
                    error!(%err, attempts, kind = %checkpoint_type, "checkpoint dropped after retries");
                }
            }
        }
        None
    }

    /// Create a global objective bound to the current session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a write fails.
    pub async fn create_objective(
        &self,
        name: &str,
        priority: Priority,
        target_metrics: HashMap<String, f64>,
        completion_criteria: Vec<String>,
    ) -> Result<GlobalObjective> {
        self.session
            .lock()
            .await
            .create_objective(name, priority, target_metrics, completion_criteria)
            .await
    }

    /// Take a manual checkpoint of the current session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Codec` if the write fails.
    pub async fn checkpoint_now(&self) -> Result<String> {
        let agent_states = serde_json::to_value(self.scheduler.snapshot().await.agents)?;
        self.session
            .lock()
            .await
            .checkpoint_now(CheckpointType::Manual, Some(agent_states))
            .await
    }

    /// Session progress, scheduler metrics and gate counters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn get_session_status(&self) -> Result<RelayStatus> {
        let session = self.session.lock().await.report().await?;
        Ok(RelayStatus {
            session,
            scheduler: self.scheduler.snapshot().await,
            gate: self.gate.stats(),
        })
    }

    /// Aggregate checkpoint, recovery and bridge counters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn get_continuity_metrics(&self) -> Result<ContinuityMetrics> {
        self.store.continuity_metrics().await
    }

    /// Drain the scheduler within the configured timeout, take a final
    /// checkpoint and stop the background loops.
    pub async fn shutdown(&self) -> ShutdownReport {
        let timeout = Duration::from_secs(self.config.scheduler.shutdown_timeout_seconds);
        let report = self.scheduler.shutdown(timeout).await;
        self.checkpoint_with_retry(CheckpointType::Automatic).await;
        self.cancel.cancel();
        for handle in self.background.lock().await.drain(..) {
            if let Err(err) = handle.await {
                warn!(%err, "background task ended abnormally");
            }
        }
        info!(
            drained = report.drained,
            aborted = report.aborted,
            "relay shut down"
        );
        report
    }
}

/// Spawn a task taking an automatic checkpoint every `period`.
fn spawn_periodic_checkpoints(
    session: Arc<Mutex<SessionOrchestrator>>,
    scheduler: Scheduler,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; the pre-task checkpoint covers it.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let agent_states = serde_json::to_value(scheduler.snapshot().await.agents).ok();
                        let outcome = session
                            .lock()
                            .await
                            .checkpoint_now(CheckpointType::Automatic, agent_states)
                            .await;
                        if let Err(err) = outcome {
                            warn!(%err, "periodic checkpoint failed");
                        }
                    }
                }
            }
            info!("periodic checkpoint task stopped");
        }
        .instrument(info_span!("periodic_checkpoints")),
    )
}
