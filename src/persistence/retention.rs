//! Retention service for time-based checkpoint purge.
//!
//! Runs as a background task deleting checkpoints and recovery events
//! older than `retention_days`. The newest checkpoint of a session that
//! has not reached a terminal status always survives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::checkpoint_repo::CheckpointRepo;
use super::db::Database;
use super::recovery_repo::RecoveryRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Rows removed by one purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Checkpoints deleted.
    pub checkpoints: u64,
    /// Recovery events deleted.
    pub recovery_events: u64,
}

/// Spawn the retention purge background task.
///
/// The task runs hourly until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
                    match purge_before(&db, cutoff).await {
                        Ok(report) => info!(
                            retention_days,
                            checkpoints = report.checkpoints,
                            recovery_events = report.recovery_events,
                            "retention purge completed"
                        ),
                        Err(err) => error!(%err, "retention purge failed"),
                    }
                }
            }
        }
    })
}

/// Delete expired checkpoints and recovery events older than `cutoff`.
///
/// # Errors
///
/// Returns `AppError::Db` if either delete fails.
pub async fn purge_before(db: &Arc<Database>, cutoff: DateTime<Utc>) -> Result<PurgeReport> {
    // The compression threshold is irrelevant for deletes.
    let checkpoints = CheckpointRepo::new(Arc::clone(db), usize::MAX)
        .delete_expired(cutoff)
        .await?;
    let recovery_events = RecoveryRepo::new(Arc::clone(db))
        .delete_before(cutoff)
        .await?;
    Ok(PurgeReport {
        checkpoints,
        recovery_events,
    })
}
