//! Durable checkpoints, continuity bridges and audited recovery.
//!
//! Every write goes through one async mutex per store so checkpoint,
//! bridge and cleanup statements never interleave. Recovery attempts are
//! recorded whether they succeed or not.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::PersistenceConfig;
use crate::models::bridge::ContinuityBridge;
use crate::models::checkpoint::{Checkpoint, CheckpointSnapshot, CheckpointType};
use crate::models::recovery::{ContinuityMetrics, RecoveryEvent};
use crate::persistence::bridge_repo::BridgeRepo;
use crate::persistence::checkpoint_repo::CheckpointRepo;
use crate::persistence::db::Database;
use crate::persistence::recovery_repo::RecoveryRepo;
use crate::persistence::retention::{self, PurgeReport};
use crate::{AppError, Result};

/// Session id recorded for recovery attempts on missing checkpoints.
const UNKNOWN_SESSION: &str = "unknown";

/// Checkpoint and bridge persistence with recovery auditing.
#[derive(Clone)]
pub struct CheckpointStore {
    db: Arc<Database>,
    checkpoints: CheckpointRepo,
    bridges: BridgeRepo,
    recoveries: RecoveryRepo,
    write_lock: Arc<Mutex<()>>,
}

impl CheckpointStore {
    /// Create a store over `db`.
    #[must_use]
    pub fn new(db: Arc<Database>, config: &PersistenceConfig) -> Self {
        Self {
            checkpoints: CheckpointRepo::new(Arc::clone(&db), config.compression_threshold_bytes),
            bridges: BridgeRepo::new(Arc::clone(&db)),
            recoveries: RecoveryRepo::new(Arc::clone(&db)),
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Persist an immutable checkpoint and return its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Codec` if the snapshot cannot be encoded or
    /// `AppError::Db` if the write fails.
    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        checkpoint_type: CheckpointType,
        snapshot: CheckpointSnapshot,
    ) -> Result<String> {
        let checkpoint = Checkpoint::new(session_id, checkpoint_type, snapshot);
        let span = info_span!(
            "create_checkpoint",
            session_id,
            checkpoint_id = %checkpoint.id,
            kind = %checkpoint_type,
        );
        async {
            let _guard = self.write_lock.lock().await;
            let stored = self.checkpoints.create(&checkpoint).await?;
            info!(
                size_bytes = stored.size_bytes,
                compressed = stored.compressed,
                "checkpoint created"
            );
            Ok(stored.id)
        }
        .instrument(span)
        .await
    }

    /// Reconstruct the snapshot stored under `checkpoint_id`.
    ///
    /// Every call records a recovery event with its outcome and elapsed
    /// time. Failing to record the event is logged and does not change the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the checkpoint does not exist, or the
    /// underlying `AppError::Db` / `AppError::Codec` if it cannot be read.
    pub async fn recover(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let started = Instant::now();
        let outcome = match self.checkpoints.get_by_id(checkpoint_id).await {
            Ok(Some(checkpoint)) => Ok(checkpoint),
            Ok(None) => Err(AppError::NotFound(format!(
                "checkpoint {checkpoint_id} not found"
            ))),
            Err(err) => Err(err),
        };
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let event = match &outcome {
            Ok(checkpoint) => RecoveryEvent::new(
                &checkpoint.session_id,
                checkpoint_id,
                true,
                elapsed_ms,
                Some(format!("recovered {} checkpoint", checkpoint.checkpoint_type)),
            ),
            Err(err) => RecoveryEvent::new(
                &self.owning_session(checkpoint_id).await,
                checkpoint_id,
                false,
                elapsed_ms,
                Some(err.to_string()),
            ),
        };
        {
            let _guard = self.write_lock.lock().await;
            if let Err(err) = self.recoveries.create(&event).await {
                error!(%err, checkpoint_id, "failed to record recovery event");
            }
        }

        match &outcome {
            Ok(_) => info!(checkpoint_id, elapsed_ms, "checkpoint recovered"),
            Err(err) => warn!(checkpoint_id, elapsed_ms, %err, "checkpoint recovery failed"),
        }
        outcome
    }

    /// Session recorded on a failed recovery: the row's owner when the row
    /// exists but cannot be decoded, otherwise `unknown`.
    async fn owning_session(&self, checkpoint_id: &str) -> String {
        match self.checkpoints.session_of(checkpoint_id).await {
            Ok(Some(session_id)) => session_id,
            Ok(None) => UNKNOWN_SESSION.to_owned(),
            Err(err) => {
                warn!(%err, checkpoint_id, "failed to look up checkpoint owner");
                UNKNOWN_SESSION.to_owned()
            }
        }
    }

    /// Record a hand-off from `source` to `target` sealed with an integrity
    /// hash.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn create_continuity_bridge(
        &self,
        source: &str,
        target: &str,
        objective_ids: Vec<String>,
        progress_map: BTreeMap<String, f64>,
    ) -> Result<ContinuityBridge> {
        let bridge = ContinuityBridge::new(source, target, objective_ids, progress_map);
        let _guard = self.write_lock.lock().await;
        let stored = self.bridges.create(&bridge).await?;
        info!(
            bridge_id = %stored.id,
            source,
            target,
            objectives = stored.objective_ids.len(),
            "continuity bridge created"
        );
        Ok(stored)
    }

    /// Retrieve a bridge by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the bridge does not exist, or
    /// `AppError::Db` if the query fails.
    pub async fn get_bridge(&self, bridge_id: &str) -> Result<ContinuityBridge> {
        self.bridges
            .get_by_id(bridge_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("bridge {bridge_id} not found")))
    }

    /// Recompute a bridge's integrity hash and compare it to the stored one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the bridge does not exist, or
    /// `AppError::Db` if it cannot be read.
    pub async fn verify_bridge(&self, bridge_id: &str) -> Result<bool> {
        let bridge = self.get_bridge(bridge_id).await?;
        let intact = bridge.verify();
        if !intact {
            warn!(bridge_id, "continuity bridge failed integrity check");
        }
        Ok(intact)
    }

    /// Purge checkpoints and recovery events older than `older_than`.
    ///
    /// The newest checkpoint of a session that has not reached a terminal
    /// status is never purged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a delete fails.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<PurgeReport> {
        let _guard = self.write_lock.lock().await;
        let report = retention::purge_before(&self.db, older_than).await?;
        info!(
            checkpoints = report.checkpoints,
            recovery_events = report.recovery_events,
            "checkpoint cleanup completed"
        );
        Ok(report)
    }

    /// All checkpoints of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        self.checkpoints.list_for_session(session_id).await
    }

    /// Newest checkpoint of a session, used to replay on resume.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn latest_for_session(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        self.checkpoints.latest_for_session(session_id).await
    }

    /// Recovery events recorded against a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn recovery_events(&self, checkpoint_id: &str) -> Result<Vec<RecoveryEvent>> {
        self.recoveries.list_for_checkpoint(checkpoint_id).await
    }

    /// Aggregate counters for observability tooling.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    #[allow(clippy::cast_precision_loss)] // Counters stay far below 2^52.
    pub async fn continuity_metrics(&self) -> Result<ContinuityMetrics> {
        let checkpoints_by_type = self.checkpoints.count_by_type().await?;
        let recoveries = self.recoveries.totals().await?;
        let total_bridges = self.bridges.count().await?;

        let recovery_success_rate = if recoveries.total == 0 {
            0.0
        } else {
            recoveries.successful as f64 / recoveries.total as f64
        };

        Ok(ContinuityMetrics {
            total_checkpoints: checkpoints_by_type.values().sum(),
            checkpoints_by_type,
            total_recoveries: recoveries.total,
            successful_recoveries: recoveries.successful,
            recovery_success_rate,
            average_recovery_ms: recoveries.average_elapsed_ms,
            total_bridges,
        })
    }
}
