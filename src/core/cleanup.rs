//! Retention cleanup for the job ledger.

use std::sync::Arc;
use std::time::Duration;

use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::db;
use crate::db::jobs::JobStats;
use crate::error::{Result, SyncError};

/// Deleting in bounded batches caps how long each statement holds the
/// write lock; the pause between batches lets other writers in.
const BATCH_SIZE: u32 = 1000;
const BATCH_PAUSE: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct CleanupService {
    db: Connection,
    retention_days: i64,
    clock: Arc<dyn Clock>,
}

impl CleanupService {
    pub fn new(db: Connection, retention_days: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            retention_days,
            clock,
        }
    }

    pub fn enabled(&self) -> bool {
        self.retention_days > 0
    }

    /// Delete jobs older than the retention window. Returns how many rows
    /// were removed; cancellation is observed between batches.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<u64> {
        if !self.enabled() {
            debug!("history retention disabled, skipping cleanup");
            return Ok(0);
        }

        let cutoff = self.clock.now() - chrono::Duration::days(self.retention_days);
        info!(
            retention_days = self.retention_days,
            cutoff = %cutoff,
            "cleaning up sync job records older than cutoff"
        );

        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let ids = db::jobs::ids_older_than(&self.db, cutoff, BATCH_SIZE).await?;
            if ids.is_empty() {
                break;
            }

            let batch_len = ids.len() as u32;
            total += db::jobs::delete_by_ids(&self.db, ids).await?;

            if batch_len < BATCH_SIZE {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(BATCH_PAUSE) => {}
            }
        }

        if total > 0 {
            info!(deleted = total, "cleaned up old sync job records");
        } else {
            debug!("no old sync job records to clean up");
        }
        Ok(total)
    }

    pub async fn stats(&self) -> Result<JobStats> {
        db::jobs::stats(&self.db).await
    }
}
