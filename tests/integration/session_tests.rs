//! Budget tracking, delegation and objective progress of sessions.

use std::collections::HashMap;
use std::sync::Arc;

use context_relay::config::{PersistenceConfig, SessionConfig};
use context_relay::models::checkpoint::CheckpointType;
use context_relay::models::objective::GlobalObjective;
use context_relay::models::session::{SessionLevel, SessionStatus};
use context_relay::models::task::Priority;
use context_relay::orchestrator::{CheckpointStore, SessionOrchestrator, UsageOutcome};
use context_relay::persistence::db::{self, Database};
use context_relay::persistence::objective_repo::ObjectiveRepo;
use context_relay::persistence::schema;
use context_relay::persistence::session_repo::SessionRepo;
use context_relay::AppError;

struct Fixture {
    db: Arc<Database>,
    store: CheckpointStore,
    objectives: ObjectiveRepo,
    sessions: SessionRepo,
}

async fn fixture() -> Fixture {
    let db = Arc::new(db::connect_memory().await.expect("db connect"));
    Fixture {
        store: CheckpointStore::new(Arc::clone(&db), &PersistenceConfig::default()),
        objectives: ObjectiveRepo::new(Arc::clone(&db)),
        sessions: SessionRepo::new(Arc::clone(&db)),
        db,
    }
}

fn small_budget() -> SessionConfig {
    SessionConfig {
        budget_limit: 100,
        delegation_threshold: 0.85,
        ..SessionConfig::default()
    }
}

async fn objective(fx: &Fixture, name: &str) -> GlobalObjective {
    fx.objectives
        .create(&GlobalObjective::new(
            name,
            Priority::High,
            HashMap::new(),
            Vec::new(),
        ))
        .await
        .expect("create objective")
}

async fn start(fx: &Fixture, config: SessionConfig) -> SessionOrchestrator {
    SessionOrchestrator::start(Arc::clone(&fx.db), fx.store.clone(), config, None)
        .await
        .expect("start session")
}

#[tokio::test]
async fn crossing_the_threshold_delegates_exactly_once() {
    let fx = fixture().await;
    let ranking = objective(&fx, "Zone ranking").await;
    let routing = objective(&fx, "Route planning").await;
    let mut parent = start(&fx, small_budget()).await;
    parent
        .update_objective_progress(&ranking.id, 0.4)
        .await
        .expect("progress");
    parent.record_result(serde_json::json!({ "task_id": "t-1" }));

    assert!(matches!(
        parent.monitor_usage(50).await,
        UsageOutcome::WithinBudget
    ));
    let child = match parent.monitor_usage(36).await {
        UsageOutcome::Delegated(child) => child,
        _ => panic!("expected delegation at 86% usage"),
    };

    // Parent is delegated, both in memory and in storage.
    assert_eq!(parent.context().status, SessionStatus::Delegated);
    assert_eq!(parent.context().consumed_budget, 86);
    assert_eq!(parent.context().child_ids, vec![child.context().id.clone()]);
    let stored = fx
        .sessions
        .get_by_id(&parent.context().id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored.status, SessionStatus::Delegated);

    // Child sits one level down with the remaining objectives.
    let ctx = child.context();
    assert_eq!(ctx.parent_id.as_deref(), Some(parent.context().id.as_str()));
    assert_eq!(ctx.depth, 1);
    assert_eq!(ctx.level, SessionLevel::Primary);
    assert_eq!(ctx.consumed_budget, 0);
    assert!(ctx.objective_ids.contains(&ranking.id));
    assert!(ctx.objective_ids.contains(&routing.id));
    assert_eq!(child.results(), parent.results());

    // One pre-delegation checkpoint and one bridge.
    let checkpoints = fx
        .store
        .list_checkpoints(&parent.context().id)
        .await
        .expect("checkpoints");
    let pre: Vec<_> = checkpoints
        .iter()
        .filter(|c| c.checkpoint_type == CheckpointType::PreDelegation)
        .collect();
    assert_eq!(pre.len(), 1);
    let metrics = fx.store.continuity_metrics().await.expect("metrics");
    assert_eq!(metrics.total_bridges, 1);

    // Inherited progress never goes backwards.
    let after = fx
        .objectives
        .get_by_id(&ranking.id)
        .await
        .expect("load")
        .expect("exists");
    assert!(after.progress >= 0.4);

    // A delegated session no longer charges usage.
    assert!(matches!(parent.monitor_usage(10).await, UsageOutcome::Inactive));
    assert_eq!(
        fx.store.continuity_metrics().await.expect("metrics").total_bridges,
        1
    );
}

#[tokio::test]
async fn completed_objectives_are_not_handed_over() {
    let fx = fixture().await;
    let done = objective(&fx, "Zone ranking").await;
    let open = objective(&fx, "Route planning").await;
    let mut parent = start(&fx, small_budget()).await;
    parent
        .update_objective_progress(&done.id, 1.0)
        .await
        .expect("complete");

    let child = parent.delegate("manual hand-off").await.expect("delegate");

    assert_eq!(child.context().objective_ids, vec![open.id.clone()]);
    let bridges = fx
        .store
        .continuity_metrics()
        .await
        .expect("metrics")
        .total_bridges;
    assert_eq!(bridges, 1);
}

#[tokio::test]
async fn objective_progress_is_monotonic() {
    let fx = fixture().await;
    let ranking = objective(&fx, "Zone ranking").await;
    let _other = objective(&fx, "Route planning").await;
    let mut session = start(&fx, small_budget()).await;

    session
        .update_objective_progress(&ranking.id, 0.6)
        .await
        .expect("raise");
    let lowered = session
        .update_objective_progress(&ranking.id, 0.3)
        .await
        .expect("lower attempt");
    assert!((lowered.progress - 0.6).abs() < 1e-9);

    let advanced = session
        .advance_objective(&ranking.id, 0.1)
        .await
        .expect("advance");
    assert!((advanced.progress - 0.7).abs() < 1e-9);

    let err = session
        .update_objective_progress("ghost", 0.5)
        .await
        .expect_err("unknown objective");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn session_completes_when_all_objectives_complete() {
    let fx = fixture().await;
    let only = objective(&fx, "Zone ranking").await;
    let mut session = start(&fx, small_budget()).await;

    session
        .update_objective_progress(&only.id, 1.0)
        .await
        .expect("complete");

    assert_eq!(session.context().status, SessionStatus::Completed);
    let stored = fx
        .sessions
        .get_by_id(&session.context().id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored.status, SessionStatus::Completed);
    assert!(matches!(session.monitor_usage(99).await, UsageOutcome::Inactive));
}

#[tokio::test]
async fn delegation_stops_at_max_depth() {
    let fx = fixture().await;
    let _objective = objective(&fx, "Zone ranking").await;
    let config = SessionConfig {
        max_depth: 1,
        ..small_budget()
    };
    let mut root = start(&fx, config.clone()).await;
    let mut child = root.delegate("first hand-off").await.expect("delegate");

    let err = child.delegate("second hand-off").await.expect_err("too deep");
    assert!(matches!(err, AppError::Delegation(_)));
    assert_eq!(child.context().status, SessionStatus::Active);

    // Exceeding the threshold at max depth keeps the session running.
    match child.monitor_usage(95).await {
        UsageOutcome::DelegationFailed(reason) => assert!(reason.contains("depth")),
        _ => panic!("expected a failed delegation"),
    }
    assert!(child.context().is_active());

    let err = SessionOrchestrator::start(
        Arc::clone(&fx.db),
        fx.store.clone(),
        config,
        Some(child.context()),
    )
    .await
    .err()
    .expect("start below max depth must fail");
    assert!(matches!(err, AppError::Delegation(_)));
}

#[tokio::test]
async fn failed_hand_off_keeps_parent_active_and_retries_once_storage_recovers() {
    let fx = fixture().await;
    let ranking = objective(&fx, "Zone ranking").await;
    let mut parent = start(&fx, small_budget()).await;

    // Bridge writes fail after the pre-delegation checkpoint lands.
    sqlx::query("DROP TABLE continuity_bridges")
        .execute(fx.db.as_ref())
        .await
        .expect("drop bridges");
    match parent.monitor_usage(86).await {
        UsageOutcome::DelegationFailed(_) => {}
        other => panic!("expected a failed delegation, got {other:?}"),
    }
    assert_eq!(parent.context().status, SessionStatus::Active);
    assert_eq!(parent.context().consumed_budget, 86, "usage is not rolled back");
    let stored = fx
        .sessions
        .get_by_id(&parent.context().id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored.status, SessionStatus::Active);

    schema::bootstrap_schema(&fx.db)
        .await
        .expect("recreate tables");
    let child = match parent.monitor_usage(1).await {
        UsageOutcome::Delegated(child) => child,
        other => panic!("expected delegation on retry, got {other:?}"),
    };

    assert_eq!(parent.context().status, SessionStatus::Delegated);
    assert_eq!(parent.context().consumed_budget, 87);
    assert!(child.context().objective_ids.contains(&ranking.id));
    let pre = fx
        .store
        .list_checkpoints(&parent.context().id)
        .await
        .expect("checkpoints")
        .into_iter()
        .filter(|c| c.checkpoint_type == CheckpointType::PreDelegation)
        .count();
    assert_eq!(pre, 1, "the first attempt's checkpoint is reused");
    let metrics = fx.store.continuity_metrics().await.expect("metrics");
    assert_eq!(metrics.total_bridges, 1);
}

#[tokio::test]
async fn resume_replays_results_from_latest_checkpoint() {
    let fx = fixture().await;
    let mut session = start(&fx, small_budget()).await;
    session.record_result(serde_json::json!({ "task_id": "t-1", "result": 7 }));
    session
        .checkpoint_now(CheckpointType::Manual, None)
        .await
        .expect("checkpoint");
    let id = session.context().id.clone();

    let resumed =
        SessionOrchestrator::resume(Arc::clone(&fx.db), fx.store.clone(), small_budget(), &id)
            .await
            .expect("resume");

    assert_eq!(resumed.context().id, id);
    assert_eq!(
        resumed.results(),
        &[serde_json::json!({ "task_id": "t-1", "result": 7 })]
    );
}

#[tokio::test]
async fn resume_refuses_unknown_and_delegated_sessions() {
    let fx = fixture().await;
    let err = SessionOrchestrator::resume(
        Arc::clone(&fx.db),
        fx.store.clone(),
        small_budget(),
        "missing",
    )
    .await
    .err()
    .expect("unknown session");
    assert!(matches!(err, AppError::NotFound(_)));

    let mut parent = start(&fx, small_budget()).await;
    let _child = parent.delegate("hand-off").await.expect("delegate");
    let err = SessionOrchestrator::resume(
        Arc::clone(&fx.db),
        fx.store.clone(),
        small_budget(),
        &parent.context().id,
    )
    .await
    .err()
    .expect("delegated session");
    assert!(matches!(err, AppError::Delegation(_)));
}

#[tokio::test]
async fn created_objectives_bind_to_the_session_and_feed_global_progress() {
    let fx = fixture().await;
    let mut session = start(&fx, small_budget()).await;
    assert!(session.global_progress().await.expect("progress").abs() < f64::EPSILON);

    let first = session
        .create_objective("Zone ranking", Priority::High, HashMap::new(), Vec::new())
        .await
        .expect("first");
    session
        .create_objective("Route planning", Priority::Low, HashMap::new(), Vec::new())
        .await
        .expect("second");
    session
        .update_objective_progress(&first.id, 0.4)
        .await
        .expect("progress");

    assert_eq!(session.context().objective_ids.len(), 2);
    let report = session.report().await.expect("report");
    assert_eq!(report.objectives.len(), 2);
    assert!((report.global_progress - 0.2).abs() < 1e-9);
    let stored = fx
        .sessions
        .get_by_id(&session.context().id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored.objective_ids.len(), 2);
}
