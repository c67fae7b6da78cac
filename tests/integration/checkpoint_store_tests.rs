//! Checkpoint persistence, recovery auditing and continuity bridges.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use context_relay::config::PersistenceConfig;
use context_relay::models::checkpoint::{CheckpointSnapshot, CheckpointType};
use context_relay::orchestrator::CheckpointStore;
use context_relay::persistence::db::{self, Database};
use context_relay::AppError;

async fn store_with_threshold(threshold: usize) -> (Arc<Database>, CheckpointStore) {
    let db = Arc::new(db::connect_memory().await.expect("db connect"));
    let config = PersistenceConfig {
        compression_threshold_bytes: threshold,
        ..PersistenceConfig::default()
    };
    (Arc::clone(&db), CheckpointStore::new(db, &config))
}

fn snapshot(note: &str) -> CheckpointSnapshot {
    CheckpointSnapshot {
        context: serde_json::json!({ "session": "s-1", "note": note }),
        objectives: serde_json::json!([{ "id": "obj-1", "progress": 0.4 }]),
        results: serde_json::json!([{ "task_id": "t-1", "result": 42 }]),
        agent_states: Some(serde_json::json!([{ "id": "agent-1", "status": "idle" }])),
    }
}

#[tokio::test]
async fn recover_returns_the_stored_snapshot() {
    let (_db, store) = store_with_threshold(1024).await;
    let original = snapshot("small");
    let id = store
        .create_checkpoint("s-1", CheckpointType::Manual, original.clone())
        .await
        .expect("create");

    let recovered = store.recover(&id).await.expect("recover");

    assert_eq!(recovered.id, id);
    assert_eq!(recovered.session_id, "s-1");
    assert_eq!(recovered.checkpoint_type, CheckpointType::Manual);
    assert!(!recovered.compressed);
    assert_eq!(recovered.snapshot, original);
}

#[tokio::test]
async fn large_context_is_compressed_and_recovered_intact() {
    let (_db, store) = store_with_threshold(64).await;
    let original = snapshot(&"zone ranking notes ".repeat(100));
    let id = store
        .create_checkpoint("s-1", CheckpointType::Automatic, original.clone())
        .await
        .expect("create");

    let recovered = store.recover(&id).await.expect("recover");

    assert!(recovered.compressed);
    let raw_len = serde_json::to_vec(&original.context).expect("encode").len();
    assert!(usize::try_from(recovered.size_bytes).expect("size") < raw_len);
    assert_eq!(recovered.snapshot, original);
}

#[tokio::test]
async fn every_recovery_attempt_is_recorded() {
    let (_db, store) = store_with_threshold(1024).await;
    let id = store
        .create_checkpoint("s-1", CheckpointType::Milestone, snapshot("ok"))
        .await
        .expect("create");

    store.recover(&id).await.expect("recover");
    let events = store.recovery_events(&id).await.expect("events");

    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].session_id, "s-1");
    assert!(events[0].elapsed_ms >= 0);
}

#[tokio::test]
async fn unknown_checkpoint_fails_and_records_a_failed_event() {
    let (_db, store) = store_with_threshold(1024).await;

    let err = store.recover("missing").await.expect_err("must fail");
    assert!(matches!(err, AppError::NotFound(_)));

    let events = store.recovery_events("missing").await.expect("events");
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].session_id, "unknown");
    assert!(events[0]
        .detail
        .as_deref()
        .is_some_and(|d| d.contains("not found")));
}

#[tokio::test]
async fn corrupt_checkpoint_failure_is_recorded_against_its_session() {
    let (db, store) = store_with_threshold(1024).await;
    let id = store
        .create_checkpoint("s-7", CheckpointType::Milestone, snapshot("intact"))
        .await
        .expect("create");
    sqlx::query("UPDATE checkpoints SET context_blob = ?1 WHERE id = ?2")
        .bind(b"{ not json".to_vec())
        .bind(&id)
        .execute(db.as_ref())
        .await
        .expect("corrupt");

    let err = store.recover(&id).await.expect_err("must fail");
    assert!(matches!(err, AppError::Codec(_)), "{err}");

    let events = store.recovery_events(&id).await.expect("events");
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].session_id, "s-7");
}

#[tokio::test]
async fn checkpoints_list_oldest_first() {
    let (_db, store) = store_with_threshold(1024).await;
    let first = store
        .create_checkpoint("s-1", CheckpointType::Automatic, snapshot("one"))
        .await
        .expect("first");
    let second = store
        .create_checkpoint("s-1", CheckpointType::Milestone, snapshot("two"))
        .await
        .expect("second");
    store
        .create_checkpoint("s-2", CheckpointType::Manual, snapshot("other"))
        .await
        .expect("other session");

    let listed = store.list_checkpoints("s-1").await.expect("list");
    let ids: Vec<&str> = listed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str()]);

    let latest = store
        .latest_for_session("s-1")
        .await
        .expect("latest")
        .expect("exists");
    assert_eq!(latest.id, second);
}

#[tokio::test]
async fn stored_bridge_verifies() {
    let (_db, store) = store_with_threshold(1024).await;
    let bridge = store
        .create_continuity_bridge(
            "parent",
            "child",
            vec!["obj-1".to_owned()],
            BTreeMap::from([("obj-1".to_owned(), 0.4)]),
        )
        .await
        .expect("bridge");

    let loaded = store.get_bridge(&bridge.id).await.expect("load");
    assert_eq!(loaded.source_session, "parent");
    assert_eq!(loaded.target_session, "child");
    assert_eq!(loaded.progress_map, bridge.progress_map);
    assert_eq!(loaded.integrity_hash, bridge.integrity_hash);
    assert!(store.verify_bridge(&bridge.id).await.expect("verify"));
}

#[tokio::test]
async fn tampered_bridge_fails_verification() {
    let (db, store) = store_with_threshold(1024).await;
    let bridge = store
        .create_continuity_bridge(
            "parent",
            "child",
            vec!["obj-1".to_owned()],
            BTreeMap::from([("obj-1".to_owned(), 0.4)]),
        )
        .await
        .expect("bridge");

    sqlx::query("UPDATE continuity_bridges SET progress_map_json = ?1 WHERE id = ?2")
        .bind(r#"{"obj-1":1.0}"#)
        .bind(&bridge.id)
        .execute(db.as_ref())
        .await
        .expect("tamper");

    assert!(!store.verify_bridge(&bridge.id).await.expect("verify"));
}

#[tokio::test]
async fn missing_bridge_is_not_found() {
    let (_db, store) = store_with_threshold(1024).await;
    let err = store.verify_bridge("nope").await.expect_err("must fail");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn cleanup_keeps_latest_checkpoint_of_live_sessions() {
    let (db, store) = store_with_threshold(1024).await;
    let old = store
        .create_checkpoint("s-1", CheckpointType::Automatic, snapshot("old"))
        .await
        .expect("old");
    let newest = store
        .create_checkpoint("s-1", CheckpointType::Milestone, snapshot("newest"))
        .await
        .expect("newest");

    // Age both checkpoints past the cutoff, keeping their order.
    let stamp = |days: i64| {
        (Utc::now() - Duration::days(days))
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    };
    for (id, days) in [(&old, 40), (&newest, 35)] {
        sqlx::query("UPDATE checkpoints SET timestamp = ?1 WHERE id = ?2")
            .bind(stamp(days))
            .bind(id)
            .execute(db.as_ref())
            .await
            .expect("backdate");
    }

    let report = store
        .cleanup(Utc::now() - Duration::days(30))
        .await
        .expect("cleanup");

    assert_eq!(report.checkpoints, 1);
    let remaining = store.list_checkpoints("s-1").await.expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, newest);
}

#[tokio::test]
async fn continuity_metrics_aggregate_counts() {
    let (_db, store) = store_with_threshold(1024).await;
    let id = store
        .create_checkpoint("s-1", CheckpointType::Automatic, snapshot("a"))
        .await
        .expect("a");
    store
        .create_checkpoint("s-1", CheckpointType::Automatic, snapshot("b"))
        .await
        .expect("b");
    store
        .create_checkpoint("s-1", CheckpointType::PreDelegation, snapshot("c"))
        .await
        .expect("c");
    store
        .create_continuity_bridge("s-1", "s-2", Vec::new(), BTreeMap::new())
        .await
        .expect("bridge");
    store.recover(&id).await.expect("recover");
    let _ = store.recover("missing").await;

    let metrics = store.continuity_metrics().await.expect("metrics");

    assert_eq!(metrics.total_checkpoints, 3);
    assert_eq!(metrics.checkpoints_by_type.get("automatic"), Some(&2));
    assert_eq!(metrics.checkpoints_by_type.get("pre_delegation"), Some(&1));
    assert_eq!(metrics.total_recoveries, 2);
    assert_eq!(metrics.successful_recoveries, 1);
    assert!((metrics.recovery_success_rate - 0.5).abs() < 1e-9);
    assert_eq!(metrics.total_bridges, 1);
}
