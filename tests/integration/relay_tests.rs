//! End-to-end pipeline: admission, checkpointing, execution, progress and
//! budget delegation.

use std::collections::HashMap;
use std::sync::Arc;

use context_relay::config::{GlobalConfig, PersistenceConfig, SchedulerConfig, SessionConfig};
use context_relay::models::task::{Priority, Task, TaskRequest, TaskStatus};
use context_relay::orchestrator::{Relay, SubmitOutcome};
use context_relay::persistence::db;
use context_relay::scheduler::{
    ExecutorRegistry, FnExecutor, HealthProbe, HealthSample, StaticProbe, TaskExecutor,
};
use context_relay::AppError;

fn relay_config(budget_limit: u64) -> GlobalConfig {
    GlobalConfig {
        scheduler: SchedulerConfig {
            min_agents: 1,
            max_agents: 2,
            cycle_interval_ms: 10,
            shutdown_timeout_seconds: 1,
            ..SchedulerConfig::default()
        },
        session: SessionConfig {
            budget_limit,
            default_task_cost: 10,
            ..SessionConfig::default()
        },
        persistence: PersistenceConfig {
            checkpoint_interval_seconds: 0,
            ..PersistenceConfig::default()
        },
        ..GlobalConfig::default()
    }
}

fn registry() -> ExecutorRegistry {
    let ranking: Arc<dyn TaskExecutor> = Arc::new(FnExecutor::new(|task: Task| async move {
        Ok::<_, AppError>(serde_json::json!({ "ranked": task.payload["zones"] }))
    }));
    let broken: Arc<dyn TaskExecutor> = Arc::new(FnExecutor::new(|_task: Task| async move {
        Err::<serde_json::Value, _>(AppError::Execution("upstream data missing".into()))
    }));
    ExecutorRegistry::new()
        .with("ranking", ranking)
        .with("broken", broken)
}

async fn relay(budget_limit: u64) -> Relay {
    let db = Arc::new(db::connect_memory().await.expect("db connect"));
    let probe: Arc<dyn HealthProbe> = Arc::new(StaticProbe(HealthSample::default()));
    Relay::start(relay_config(budget_limit), db, registry(), probe)
        .await
        .expect("relay start")
}

fn request(capability: &str) -> TaskRequest {
    TaskRequest {
        objective: "Rank every delivery zone by weekly order volume for the routing team"
            .to_owned(),
        deliverable: Some("Ranked list of zones with weekly volumes".to_owned()),
        success_criteria: vec!["Every active zone appears exactly once".to_owned()],
        capability: Some(capability.to_owned()),
        payload: serde_json::json!({ "zones": ["north", "south"] }),
        ..TaskRequest::default()
    }
}

async fn checkpoint_count(relay: &Relay, kind: &str) -> u64 {
    relay
        .get_continuity_metrics()
        .await
        .expect("metrics")
        .checkpoints_by_type
        .get(kind)
        .copied()
        .unwrap_or(0)
}

#[tokio::test]
async fn approved_request_runs_and_is_checkpointed() {
    let relay = relay(10_000).await;

    let outcome = relay.submit_task(request("ranking")).await.expect("submit");

    match &outcome {
        SubmitOutcome::Approved {
            status,
            result,
            delegated_to,
            validation,
            ..
        } => {
            assert_eq!(*status, TaskStatus::Completed);
            assert_eq!(
                result.as_ref(),
                Some(&serde_json::json!({ "ranked": ["north", "south"] }))
            );
            assert!(delegated_to.is_none());
            assert!(validation.is_valid);
        }
        SubmitOutcome::Rejected { issues, .. } => panic!("rejected: {issues:?}"),
    }
    assert!(outcome.is_approved());
    assert_eq!(checkpoint_count(&relay, "automatic").await, 1);
    assert_eq!(checkpoint_count(&relay, "milestone").await, 1);

    let status = relay.get_session_status().await.expect("status");
    assert_eq!(status.scheduler.completed, 1);
    assert_eq!(status.gate.approvals, 1);
    assert_eq!(status.session.results_recorded, 1);
    assert_eq!(status.session.session.consumed_budget, 10);

    relay.shutdown().await;
}

#[tokio::test]
async fn rejected_request_never_reaches_the_scheduler() {
    let relay = relay(10_000).await;

    let outcome = relay
        .submit_task(TaskRequest::new("Hacer algo con datos"))
        .await
        .expect("submit");

    match outcome {
        SubmitOutcome::Rejected {
            issues,
            recommendations,
            ..
        } => {
            assert!(issues.iter().any(|i| i.contains("too short")));
            assert!(!recommendations.is_empty());
        }
        SubmitOutcome::Approved { .. } => panic!("vague request must be rejected"),
    }
    let status = relay.get_session_status().await.expect("status");
    assert_eq!(status.scheduler.pending + status.scheduler.completed, 0);
    assert_eq!(status.gate.rejections, 1);
    assert_eq!(checkpoint_count(&relay, "automatic").await, 0);

    relay.shutdown().await;
}

#[tokio::test]
async fn unknown_dependency_is_reported_as_rejection() {
    let relay = relay(10_000).await;
    let mut req = request("ranking");
    req.dependencies = vec!["never-submitted".to_owned()];

    let outcome = relay.submit_task(req).await.expect("submit");

    match outcome {
        SubmitOutcome::Rejected { issues, .. } => {
            assert!(issues.iter().any(|i| i.contains("never-submitted")));
        }
        SubmitOutcome::Approved { .. } => panic!("dependency can never complete"),
    }
    relay.shutdown().await;
}

#[tokio::test]
async fn dependent_request_runs_after_its_dependency() {
    let relay = relay(10_000).await;
    let mut first = request("ranking");
    first.task_id = Some("volumes".to_owned());
    relay.submit_task(first).await.expect("first");

    let mut second = request("ranking");
    second.task_id = Some("ranking".to_owned());
    second.dependencies = vec!["volumes".to_owned()];
    let outcome = relay.submit_task(second).await.expect("second");

    match outcome {
        SubmitOutcome::Approved { task_id, status, .. } => {
            assert_eq!(task_id, "ranking");
            assert_eq!(status, TaskStatus::Completed);
        }
        SubmitOutcome::Rejected { issues, .. } => panic!("rejected: {issues:?}"),
    }
    relay.shutdown().await;
}

#[tokio::test]
async fn failed_critical_task_takes_error_recovery_checkpoint() {
    let relay = relay(10_000).await;
    let mut req = request("broken");
    req.priority = Priority::Critical;

    let outcome = relay.submit_task(req).await.expect("submit");

    match outcome {
        SubmitOutcome::Approved { status, error, .. } => {
            assert_eq!(status, TaskStatus::Failed);
            assert!(error.is_some_and(|e| e.contains("upstream data missing")));
        }
        SubmitOutcome::Rejected { issues, .. } => panic!("rejected: {issues:?}"),
    }
    assert_eq!(checkpoint_count(&relay, "error_recovery").await, 1);

    let mut ordinary = request("broken");
    ordinary.priority = Priority::High;
    relay.submit_task(ordinary).await.expect("submit");
    assert_eq!(checkpoint_count(&relay, "error_recovery").await, 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn successful_tasks_advance_their_objectives() {
    let relay = relay(10_000).await;
    let objective = relay
        .create_objective(
            "Zone ranking",
            Priority::High,
            HashMap::from([("coverage".to_owned(), 1.0)]),
            vec!["every zone ranked".to_owned()],
        )
        .await
        .expect("objective");

    let mut req = request("ranking");
    req.objective_ids = vec![objective.id.clone()];
    relay.submit_task(req.clone()).await.expect("first");
    relay.submit_task(req).await.expect("second");

    let status = relay.get_session_status().await.expect("status");
    let progress = status
        .session
        .objectives
        .iter()
        .find(|o| o.id == objective.id)
        .map(|o| o.progress)
        .expect("bound objective");
    assert!((progress - 0.2).abs() < 1e-9);

    relay.shutdown().await;
}

#[tokio::test]
async fn completed_session_refuses_further_submissions() {
    let db = Arc::new(db::connect_memory().await.expect("db connect"));
    let probe: Arc<dyn HealthProbe> = Arc::new(StaticProbe(HealthSample::default()));
    let mut config = relay_config(10_000);
    config.session.progress_increment = 1.0;
    let relay = Relay::start(config, db, registry(), probe)
        .await
        .expect("relay start");
    let objective = relay
        .create_objective("Zone ranking", Priority::High, HashMap::new(), Vec::new())
        .await
        .expect("objective");

    let mut req = request("ranking");
    req.objective_ids = vec![objective.id.clone()];
    assert!(relay.submit_task(req.clone()).await.expect("first").is_approved());

    let err = relay.submit_task(req).await.expect_err("session completed");
    assert!(matches!(err, AppError::Execution(ref msg) if msg.contains("completed")));
    let status = relay.get_session_status().await.expect("status");
    assert_eq!(status.scheduler.completed, 1, "second task never ran");

    relay.shutdown().await;
}

#[tokio::test]
async fn exhausting_the_budget_hands_over_to_a_child_session() {
    let relay = relay(100).await;
    let root = relay.session_id().await;

    let mut req = request("ranking");
    req.budget_cost = Some(90);
    let outcome = relay.submit_task(req).await.expect("submit");

    let child = match outcome {
        SubmitOutcome::Approved { delegated_to, .. } => delegated_to.expect("delegated"),
        SubmitOutcome::Rejected { issues, .. } => panic!("rejected: {issues:?}"),
    };
    assert_ne!(child, root);
    assert_eq!(relay.session_id().await, child);
    assert_eq!(checkpoint_count(&relay, "pre_delegation").await, 1);
    assert_eq!(
        relay
            .get_continuity_metrics()
            .await
            .expect("metrics")
            .total_bridges,
        1
    );

    let status = relay.get_session_status().await.expect("status");
    assert_eq!(status.session.session.parent_id.as_deref(), Some(root.as_str()));
    assert_eq!(status.session.session.consumed_budget, 0);
    assert_eq!(status.session.results_recorded, 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn manual_checkpoint_can_be_recovered() {
    let relay = relay(10_000).await;
    relay.submit_task(request("ranking")).await.expect("submit");

    let id = relay.checkpoint_now().await.expect("checkpoint");
    let recovered = relay.store().recover(&id).await.expect("recover");

    assert_eq!(recovered.session_id, relay.session_id().await);
    assert!(recovered.snapshot.agent_states.is_some());
    assert_eq!(
        recovered.snapshot.results.as_array().map(Vec::len),
        Some(1)
    );
    let metrics = relay.get_continuity_metrics().await.expect("metrics");
    assert_eq!(metrics.successful_recoveries, 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn shutdown_rejects_further_work() {
    let relay = relay(10_000).await;
    let report = relay.shutdown().await;
    assert!(report.drained);

    let err = relay
        .submit_task(request("ranking"))
        .await
        .expect_err("scheduler is draining");
    assert!(matches!(err, AppError::Execution(_)));
}
