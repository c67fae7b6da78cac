//! Retention purge of expired checkpoints and recovery events.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use context_relay::models::checkpoint::{Checkpoint, CheckpointSnapshot, CheckpointType};
use context_relay::models::recovery::RecoveryEvent;
use context_relay::models::session::{SessionContext, SessionStatus};
use context_relay::persistence::{
    checkpoint_repo::CheckpointRepo, db, recovery_repo::RecoveryRepo, retention,
    session_repo::SessionRepo,
};

/// Insert a checkpoint stamped `days_ago` days in the past.
async fn aged_checkpoint(repo: &CheckpointRepo, session_id: &str, days_ago: i64) -> String {
    let mut checkpoint = Checkpoint::new(
        session_id,
        CheckpointType::Automatic,
        CheckpointSnapshot::default(),
    );
    checkpoint.created_at = Utc::now() - Duration::days(days_ago);
    repo.create(&checkpoint).await.expect("create checkpoint").id
}

#[tokio::test]
async fn terminal_sessions_lose_every_expired_checkpoint() {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    let checkpoints = CheckpointRepo::new(Arc::clone(&db), 1024);
    let sessions = SessionRepo::new(Arc::clone(&db));

    let mut delegated = SessionContext::new(Vec::new(), 100);
    delegated.status = SessionStatus::Delegated;
    sessions.create(&delegated).await.expect("delegated session");
    let active = SessionContext::new(Vec::new(), 100);
    sessions.create(&active).await.expect("active session");

    aged_checkpoint(&checkpoints, &delegated.id, 50).await;
    aged_checkpoint(&checkpoints, &delegated.id, 45).await;
    aged_checkpoint(&checkpoints, &active.id, 50).await;
    let active_latest = aged_checkpoint(&checkpoints, &active.id, 45).await;
    let recent = aged_checkpoint(&checkpoints, &active.id, 1).await;

    let report = retention::purge_before(&db, Utc::now() - Duration::days(30))
        .await
        .expect("purge");

    assert_eq!(report.checkpoints, 4);
    assert!(checkpoints
        .list_for_session(&delegated.id)
        .await
        .expect("list")
        .is_empty());
    let kept: Vec<String> = checkpoints
        .list_for_session(&active.id)
        .await
        .expect("list")
        .into_iter()
        .map(|c| c.id)
        .collect();
    // The newest checkpoint is recent, so the older ones are not protected.
    assert_eq!(kept, vec![recent]);
    assert!(!kept.contains(&active_latest));
}

#[tokio::test]
async fn sessions_unknown_to_the_store_keep_their_newest_checkpoint() {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    let checkpoints = CheckpointRepo::new(Arc::clone(&db), 1024);

    aged_checkpoint(&checkpoints, "orphan", 60).await;
    let newest = aged_checkpoint(&checkpoints, "orphan", 40).await;

    let report = retention::purge_before(&db, Utc::now() - Duration::days(30))
        .await
        .expect("purge");

    assert_eq!(report.checkpoints, 1);
    let kept = checkpoints.latest_for_session("orphan").await.expect("latest");
    assert_eq!(kept.map(|c| c.id), Some(newest));
}

#[tokio::test]
async fn old_recovery_events_are_purged() {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    let recoveries = RecoveryRepo::new(Arc::clone(&db));

    let mut old = RecoveryEvent::new("s-1", "c-1", true, 3, None);
    old.created_at = Utc::now() - Duration::days(90);
    recoveries.create(&old).await.expect("old event");
    recoveries
        .create(&RecoveryEvent::new("s-1", "c-1", false, 5, Some("boom".into())))
        .await
        .expect("recent event");

    let report = retention::purge_before(&db, Utc::now() - Duration::days(30))
        .await
        .expect("purge");

    assert_eq!(report.recovery_events, 1);
    let left = recoveries.list_for_checkpoint("c-1").await.expect("list");
    assert_eq!(left.len(), 1);
    assert!(!left[0].success);
}

#[tokio::test]
async fn retention_task_stops_on_cancel() {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    let cancel = CancellationToken::new();
    let handle = retention::spawn_retention_task(Arc::clone(&db), 30, cancel.clone());

    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("task stops promptly")
        .expect("task did not panic");
}
