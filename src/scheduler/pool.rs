//! Bounded agent pool with dependency- and health-aware dispatch.
//!
//! All queues, the agent registry and per-task waiters live in one
//! [`SchedulerState`] behind a single async mutex. A dispatch cycle never
//! waits on task completion: it spawns the executor future and returns, and
//! the spawned task reports back through [`Scheduler::record_result`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::models::agent::{Agent, AgentStatus};
use crate::models::task::{Task, TaskStatus};
use crate::{AppError, Result};

use super::executor::ExecutorRegistry;
use super::health::{HealthProbe, HealthSample};

/// Capability label given to agents spawned before any task arrives.
const GENERAL_CAPABILITY: &str = "general";

/// Poll period while waiting for in-flight tasks during shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Events broadcast to scheduler subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A new agent joined the pool.
    AgentSpawned {
        /// New agent.
        agent_id: String,
        /// Capability it was spawned for.
        capability: String,
    },
    /// A task started executing.
    TaskDispatched {
        /// Dispatched task.
        task_id: String,
        /// Agent running it.
        agent_id: String,
    },
    /// A task finished successfully.
    TaskCompleted {
        /// Finished task.
        task_id: String,
        /// Agent that ran it.
        agent_id: String,
        /// Execution time in milliseconds.
        latency_ms: f64,
    },
    /// A task failed, either while executing or because it can no longer run.
    TaskFailed {
        /// Failed task.
        task_id: String,
        /// Agent that ran it, if it was dispatched.
        agent_id: Option<String>,
        /// Failure description.
        error: String,
    },
    /// A cycle skipped dispatch because a health ceiling was exceeded.
    Overload {
        /// Which ceiling was exceeded.
        reason: String,
    },
}

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Agents added to the pool.
    pub spawned: usize,
    /// Tasks handed to agents.
    pub dispatched: usize,
    /// Whether dispatch was skipped for health reasons.
    pub overloaded: bool,
}

/// Queue and pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    /// Tasks waiting for dispatch.
    pub pending: usize,
    /// Tasks executing.
    pub running: usize,
    /// Tasks finished successfully since start.
    pub completed: usize,
    /// Tasks that failed since start.
    pub failed: usize,
    /// Every agent in the pool with its metrics. Paused agents beyond
    /// `max_agents` are retired oldest first.
    pub agents: Vec<Agent>,
}

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Whether every in-flight task finished before the timeout.
    pub drained: bool,
    /// In-flight tasks aborted after the timeout.
    pub aborted: usize,
    /// Pending tasks failed because they were never dispatched.
    pub abandoned: usize,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<String, Task>,
    pending: Vec<String>,
    running: HashSet<String>,
    completed: usize,
    failed: usize,
    finished: VecDeque<String>,
    agents: BTreeMap<String, Agent>,
    paused: VecDeque<String>,
    in_flight: HashMap<String, AbortHandle>,
    waiters: HashMap<String, Vec<oneshot::Sender<Task>>>,
    next_seq: u64,
    draining: bool,
}

impl SchedulerState {
    fn dependency_done(&self, id: &str) -> bool {
        self.tasks
            .get(id)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    }

    fn live_agents(&self) -> usize {
        self.agents
            .values()
            .filter(|a| a.status != AgentStatus::Paused)
            .count()
    }

    fn notify_waiters(&mut self, task_id: &str) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        for tx in self.waiters.remove(task_id).unwrap_or_default() {
            // A dropped receiver only means nobody is waiting any more.
            let _ = tx.send(task.clone());
        }
    }

    /// Record `task_id` as finished and evict the oldest finished tasks
    /// beyond `limit`. Tasks a pending task still depends on are kept.
    fn retire(&mut self, task_id: &str, success: bool, limit: usize) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.finished.push_back(task_id.to_owned());
        if self.finished.len() <= limit {
            return;
        }

        let needed: HashSet<&String> = self
            .pending
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .flat_map(|t| t.dependencies.iter())
            .collect();
        let mut excess = self.finished.len() - limit;
        let mut kept = VecDeque::with_capacity(limit);
        let mut evicted = Vec::new();
        for id in self.finished.drain(..) {
            if excess > 0 && !needed.contains(&id) {
                excess -= 1;
                evicted.push(id);
            } else {
                kept.push_back(id);
            }
        }
        self.finished = kept;
        for id in &evicted {
            self.tasks.remove(id);
        }
        debug!(evicted = evicted.len(), retained = self.finished.len(), "task history trimmed");
    }

    /// Drop the oldest paused agents once more than `limit` are held.
    fn retire_paused(&mut self, limit: usize) {
        while self.paused.len() > limit {
            if let Some(id) = self.paused.pop_front() {
                self.agents.remove(&id);
                info!(agent_id = %id, "paused agent retired");
            }
        }
    }

    /// Fail a task that never ran.
    fn fail_unstarted(&mut self, task_id: &str, error: String, limit: usize) {
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.error = Some(error);
            task.completed_at = Some(Utc::now());
        }
        self.pending.retain(|id| id != task_id);
        self.notify_waiters(task_id);
        self.retire(task_id, false, limit);
    }
}

/// Bounded worker pool executing admitted tasks.
///
/// Cloning is cheap and every clone drives the same pool.
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    state: Arc<Mutex<SchedulerState>>,
    executors: Arc<ExecutorRegistry>,
    probe: Arc<dyn HealthProbe>,
    events: broadcast::Sender<SchedulerEvent>,
    stop: CancellationToken,
}

impl Scheduler {
    /// Build a scheduler pre-seeded with `min_agents` idle agents.
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        executors: ExecutorRegistry,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let mut state = SchedulerState::default();
        for _ in 0..config.min_agents.min(config.max_agents) {
            let agent = Agent::new(GENERAL_CAPABILITY);
            state.agents.insert(agent.id.clone(), agent);
        }
        let (events, _) = broadcast::channel(256);
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
            executors: Arc::new(executors),
            probe,
            events,
            stop: CancellationToken::new(),
        }
    }

    /// Subscribe to scheduler events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Admit a task into the pending queue and return its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Dependency` if a dependency is unknown, has
    /// failed, or is the task itself; `AppError::Execution` if the id is
    /// already queued or the scheduler is shutting down.
    pub async fn enqueue(&self, mut task: Task) -> Result<String> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.draining {
            return Err(AppError::Execution("scheduler is shutting down".into()));
        }
        if state.tasks.contains_key(&task.id) {
            return Err(AppError::Execution(format!("task {} already enqueued", task.id)));
        }
        for dep in &task.dependencies {
            if *dep == task.id {
                return Err(AppError::Dependency(format!("task {dep} depends on itself")));
            }
            match state.tasks.get(dep).map(|t| t.status) {
                None => {
                    return Err(AppError::Dependency(format!(
                        "dependency {dep} is neither queued nor completed"
                    )))
                }
                Some(TaskStatus::Failed) => {
                    return Err(AppError::Dependency(format!("dependency {dep} has failed")))
                }
                Some(_) => {}
            }
        }

        task.seq = state.next_seq;
        state.next_seq += 1;
        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        let id = task.id.clone();
        debug!(task_id = %id, priority = task.priority.as_str(), "task enqueued");
        state.pending.push(id.clone());
        state.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Run one scheduling cycle.
    ///
    /// Agents that finished their last task are returned to the pool (or
    /// paused after repeated failures), health ceilings are checked, and
    /// each ready task is paired with an idle agent, spawning agents up to
    /// `max_agents` when there are not enough.
    pub async fn run_cycle(&self) -> CycleReport {
        let sample = self.probe.sample();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut report = CycleReport::default();

        if state.draining {
            return report;
        }

        // ── Return finished agents to the pool ─────────────
        let pause_after = self.config.pause_after_failures;
        for agent in state.agents.values_mut() {
            if matches!(agent.status, AgentStatus::Completed | AgentStatus::Error) {
                if pause_after > 0 && agent.consecutive_failures >= pause_after {
                    warn!(agent_id = %agent.id, failures = agent.consecutive_failures, "agent paused");
                    agent.status = AgentStatus::Paused;
                    state.paused.push_back(agent.id.clone());
                } else {
                    agent.status = AgentStatus::Idle;
                }
            }
        }
        state.retire_paused(self.config.max_agents);

        // ── Health ceilings ────────────────────────────────
        if let Some(reason) = self.overload_reason(sample, state.live_agents()) {
            warn!(%reason, "dispatch skipped: overload");
            self.emit(SchedulerEvent::Overload { reason });
            report.overloaded = true;
            return report;
        }

        // ── Ready set: priority desc, arrival asc ──────────
        let mut ready: Vec<&Task> = state
            .pending
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.dependencies.iter().all(|d| state.dependency_done(d)))
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        let ready: Vec<(String, String)> = ready
            .into_iter()
            .map(|t| (t.id.clone(), t.capability.clone()))
            .collect();

        // ── Pair ready tasks with agents ───────────────────
        for (task_id, capability) in ready {
            let agent_id = if let Some(id) = pick_idle(&state.agents, &capability) {
                id
            } else if state.live_agents() < self.config.max_agents {
                let agent = Agent::new(capability.clone());
                let id = agent.id.clone();
                info!(agent_id = %id, %capability, "agent spawned");
                state.agents.insert(id.clone(), agent);
                self.emit(SchedulerEvent::AgentSpawned {
                    agent_id: id.clone(),
                    capability: capability.clone(),
                });
                report.spawned += 1;
                id
            } else {
                break;
            };
            self.dispatch(state, &task_id, &agent_id);
            report.dispatched += 1;
        }

        if report.dispatched > 0 || report.spawned > 0 {
            debug!(
                dispatched = report.dispatched,
                spawned = report.spawned,
                pending = state.pending.len(),
                running = state.running.len(),
                "dispatch cycle"
            );
        }
        report
    }

    fn overload_reason(&self, sample: HealthSample, live_agents: usize) -> Option<String> {
        let cfg = &self.config;
        if sample.memory_mb > cfg.max_memory_mb {
            return Some(format!(
                "memory {:.0} MB exceeds {:.0} MB",
                sample.memory_mb, cfg.max_memory_mb
            ));
        }
        if sample.cpu_percent > cfg.max_cpu_percent {
            return Some(format!(
                "cpu {:.1}% exceeds {:.1}%",
                sample.cpu_percent, cfg.max_cpu_percent
            ));
        }
        if live_agents > cfg.max_agents {
            return Some(format!(
                "{live_agents} live agents exceed {}",
                cfg.max_agents
            ));
        }
        None
    }

    /// Move a task to running on `agent_id` and spawn its executor.
    fn dispatch(&self, state: &mut SchedulerState, task_id: &str, agent_id: &str) {
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };
        task.status = TaskStatus::Running;
        task.assigned_agent = Some(agent_id.to_owned());
        task.started_at = Some(Utc::now());
        let task = task.clone();

        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.status = AgentStatus::Working;
            agent.current_task = Some(task_id.to_owned());
            agent.capability.clone_from(&task.capability);
        }
        state.pending.retain(|id| id != task_id);
        state.running.insert(task_id.to_owned());

        info!(task_id, agent_id, capability = %task.capability, "task dispatched");
        self.emit(SchedulerEvent::TaskDispatched {
            task_id: task_id.to_owned(),
            agent_id: agent_id.to_owned(),
        });

        let executor = self.executors.resolve(&task.capability);
        let timeout_secs = self.config.task_timeout_seconds;
        let scheduler = self.clone();
        let agent = agent_id.to_owned();
        let span = info_span!("execute_task", task_id, agent_id);
        let handle = tokio::spawn(
            async move {
                let outcome = match executor {
                    None => Err(AppError::Execution(format!(
                        "no executor registered for capability {}",
                        task.capability
                    ))),
                    Some(executor) if timeout_secs > 0 => {
                        let limit = Duration::from_secs(timeout_secs);
                        let guarded = AssertUnwindSafe(executor.execute(&task)).catch_unwind();
                        match tokio::time::timeout(limit, guarded).await {
                            Ok(caught) => caught.unwrap_or_else(|panic| Err(panicked(&*panic))),
                            Err(_) => Err(AppError::Execution(format!(
                                "timed out after {timeout_secs}s"
                            ))),
                        }
                    }
                    Some(executor) => AssertUnwindSafe(executor.execute(&task))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(panicked(&*panic))),
                };
                if let Err(err) = scheduler.record_result(&task.id, &agent, outcome).await {
                    warn!(%err, "failed to record task result");
                }
            }
            .instrument(span),
        );
        state
            .in_flight
            .insert(task_id.to_owned(), handle.abort_handle());
    }

    /// Record the outcome of a running task reported by `agent_id`.
    ///
    /// Updates the agent's latency and success metrics, marks the task
    /// completed or failed, and wakes anyone waiting on it. A failure also
    /// fails every pending task that depends on it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task,
    /// `AppError::Unauthorized` if `agent_id` is not the assigned agent, or
    /// `AppError::Execution` if the task is not running.
    pub async fn record_result(
        &self,
        task_id: &str,
        agent_id: &str,
        outcome: Result<serde_json::Value>,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
        if task.assigned_agent.as_deref() != Some(agent_id) {
            return Err(AppError::Unauthorized(format!(
                "agent {agent_id} is not assigned to task {task_id}"
            )));
        }
        if task.status != TaskStatus::Running {
            return Err(AppError::Execution(format!("task {task_id} is not running")));
        }

        let now = Utc::now();
        #[allow(clippy::cast_precision_loss)] // Latencies in microseconds fit in f64.
        let latency_ms = task
            .started_at
            .and_then(|started| (now - started).num_microseconds())
            .map_or(0.0, |us| us as f64 / 1000.0);
        task.completed_at = Some(now);
        let success = outcome.is_ok();
        match outcome {
            Ok(value) => {
                task.status = TaskStatus::Completed;
                task.result = Some(value);
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.error = Some(err.to_string());
            }
        }
        let error = task.error.clone();

        state.running.remove(task_id);
        state.in_flight.remove(task_id);
        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.record_outcome(success, latency_ms);
        }

        if success {
            info!(task_id, agent_id, latency_ms, "task completed");
            self.emit(SchedulerEvent::TaskCompleted {
                task_id: task_id.to_owned(),
                agent_id: agent_id.to_owned(),
                latency_ms,
            });
        } else {
            let error = error.unwrap_or_default();
            warn!(task_id, agent_id, %error, "task failed");
            self.emit(SchedulerEvent::TaskFailed {
                task_id: task_id.to_owned(),
                agent_id: Some(agent_id.to_owned()),
                error,
            });
            self.fail_dependents(state, task_id);
        }

        state.notify_waiters(task_id);
        state.retire(task_id, success, self.config.task_history_limit);
        Ok(())
    }

    /// Fail pending tasks that transitively depend on `failed_id`.
    fn fail_dependents(&self, state: &mut SchedulerState, failed_id: &str) {
        let mut frontier = vec![failed_id.to_owned()];
        while let Some(failed) = frontier.pop() {
            let dependents: Vec<String> = state
                .pending
                .iter()
                .filter(|id| {
                    state
                        .tasks
                        .get(*id)
                        .is_some_and(|t| t.dependencies.contains(&failed))
                })
                .cloned()
                .collect();
            for id in dependents {
                let error = format!("dependency {failed} failed");
                warn!(task_id = %id, %error, "dependent task failed");
                state.fail_unstarted(&id, error.clone(), self.config.task_history_limit);
                self.emit(SchedulerEvent::TaskFailed {
                    task_id: id.clone(),
                    agent_id: None,
                    error,
                });
                frontier.push(id);
            }
        }
    }

    /// Wait until `task_id` completes or fails and return its final state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task, or
    /// `AppError::Execution` if the scheduler is dropped first.
    pub async fn wait_for(&self, task_id: &str) -> Result<Task> {
        let rx = {
            let mut state = self.state.lock().await;
            let task = state
                .tasks
                .get(task_id)
                .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))?;
            if task.status.is_terminal() {
                return Ok(task.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(task_id.to_owned()).or_default().push(tx);
            rx
        };
        rx.await.map_err(|_| {
            AppError::Execution(format!("scheduler dropped before task {task_id} finished"))
        })
    }

    /// Current state of a task.
    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.state.lock().await.tasks.get(task_id).cloned()
    }

    /// Queue counters and agent metrics.
    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock().await;
        SchedulerSnapshot {
            pending: state.pending.len(),
            running: state.running.len(),
            completed: state.completed,
            failed: state.failed,
            agents: state.agents.values().cloned().collect(),
        }
    }

    /// Spawn the background loop running a cycle every `cycle_interval_ms`
    /// until `cancel` fires or the scheduler shuts down.
    #[must_use]
    pub fn spawn_dispatch_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        let period = Duration::from_millis(self.config.cycle_interval_ms);
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = scheduler.stop.cancelled() => break,
                        _ = interval.tick() => {
                            scheduler.run_cycle().await;
                        }
                    }
                }
                info!("dispatch loop stopped");
            }
            .instrument(info_span!("dispatch_loop")),
        )
    }

    /// Stop dispatching, wait up to `timeout` for in-flight tasks, then
    /// abort whatever is still running.
    ///
    /// Aborted and never-dispatched tasks are marked failed so waiters are
    /// released.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.stop.cancel();
        let in_flight = {
            let mut state = self.state.lock().await;
            state.draining = true;
            state.running.len()
        };
        info!(in_flight, timeout_secs = timeout.as_secs(), "draining scheduler");

        let drained = tokio::time::timeout(timeout, async {
            while !self.state.lock().await.running.is_empty() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await
        .is_ok();

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut report = ShutdownReport {
            drained,
            ..ShutdownReport::default()
        };

        let stuck: Vec<String> = state.running.drain().collect();
        for task_id in stuck {
            if let Some(handle) = state.in_flight.remove(&task_id) {
                handle.abort();
            }
            let agent_id = state.tasks.get_mut(&task_id).and_then(|task| {
                task.status = TaskStatus::Failed;
                task.error = Some("aborted: shutdown timeout elapsed".into());
                task.completed_at = Some(Utc::now());
                task.assigned_agent.clone()
            });
            if let Some(agent) = agent_id.as_deref().and_then(|id| state.agents.get_mut(id)) {
                agent.record_outcome(false, 0.0);
            }
            state.notify_waiters(&task_id);
            state.retire(&task_id, false, self.config.task_history_limit);
            report.aborted += 1;
        }

        let pending: Vec<String> = state.pending.clone();
        for task_id in pending {
            state.fail_unstarted(
                &task_id,
                "scheduler shut down before dispatch".into(),
                self.config.task_history_limit,
            );
            report.abandoned += 1;
        }

        info!(
            drained,
            aborted = report.aborted,
            abandoned = report.abandoned,
            "scheduler shut down"
        );
        report
    }
}

/// Turn a caught executor panic into a task failure.
fn panicked(payload: &(dyn std::any::Any + Send)) -> AppError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into());
    AppError::Execution(format!("executor panicked: {detail}"))
}

/// Prefer an idle agent bound to `capability`, else any idle agent.
fn pick_idle(agents: &BTreeMap<String, Agent>, capability: &str) -> Option<String> {
    agents
        .values()
        .find(|a| a.is_idle() && a.capability == capability)
        .or_else(|| agents.values().find(|a| a.is_idle()))
        .map(|a| a.id.clone())
}
