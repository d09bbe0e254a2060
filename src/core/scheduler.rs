//! Periodic sync and cleanup timers, plus the on-demand surface.
//!
//! Two independent loops run on a child of the host's shutdown token. A
//! tick failure is logged and swallowed so the loop continues; a tick that
//! fires while the previous fan-out is still running is delayed, not
//! dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::core::cleanup::CleanupService;
use crate::core::syncer::Syncer;
use crate::db;
use crate::error::Result;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const CLEANUP_INITIAL_DELAY: Duration = Duration::from_secs(60);

pub struct Scheduler {
    db: Connection,
    syncer: Syncer,
    cleanup: CleanupService,
    sync_interval: i64,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(db: Connection, syncer: Syncer, cleanup: CleanupService, config: &AppConfig) -> Self {
        Self {
            db,
            syncer,
            cleanup,
            sync_interval: config.sync.interval,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Spawn the timer loops. They stop when `shutdown` fires or when
    /// [`Scheduler::stop`] is called.
    pub async fn start(&self, shutdown: &CancellationToken) {
        let cancel = shutdown.child_token();
        let mut state = self.state.lock().await;

        if self.sync_interval > 0 {
            let period = Duration::from_secs(self.sync_interval as u64);
            state.tasks.push(tokio::spawn(sync_loop(
                self.db.clone(),
                self.syncer.clone(),
                period,
                cancel.clone(),
            )));
        } else {
            info!("sync scheduler disabled (interval <= 0)");
        }

        if self.cleanup.enabled() {
            state
                .tasks
                .push(tokio::spawn(cleanup_loop(self.cleanup.clone(), cancel.clone())));
        } else {
            info!("cleanup scheduler disabled (history_retention_days <= 0)");
        }

        state.cancel = Some(cancel);
    }

    /// Cancel the timers and wait for the loops (and any in-flight fan-out
    /// they drive) to wind down.
    pub async fn stop(&self) {
        let (cancel, tasks) = {
            let mut state = self.state.lock().await;
            (state.cancel.take(), std::mem::take(&mut state.tasks))
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }

    pub async fn run_sync_now(&self) -> Result<()> {
        info!("manual sync triggered");
        let cancel = self.current_cancel().await;
        run_sync(&self.db, &self.syncer, &cancel).await
    }

    pub async fn run_cleanup_now(&self) -> Result<u64> {
        info!("manual cleanup triggered");
        let cancel = self.current_cancel().await;
        self.cleanup.run(&cancel).await
    }

    pub async fn health_check_all(&self) -> Result<HashMap<String, Option<String>>> {
        let cancel = self.current_cancel().await;
        self.syncer.health_check_all(&cancel).await
    }

    async fn current_cancel(&self) -> CancellationToken {
        self.state
            .lock()
            .await
            .cancel
            .clone()
            .unwrap_or_default()
    }
}

async fn sync_loop(db: Connection, syncer: Syncer, period: Duration, cancel: CancellationToken) {
    info!(interval_secs = period.as_secs(), "sync scheduler started");

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("sync scheduler stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = run_sync(&db, &syncer, &cancel).await {
                    error!(error = %e, "scheduled sync failed");
                }
            }
        }
    }
}

async fn run_sync(db: &Connection, syncer: &Syncer, cancel: &CancellationToken) -> Result<()> {
    let targets = db::targets::list_enabled(db).await?;
    if targets.is_empty() {
        info!("no enabled targets for sync");
        return Ok(());
    }

    let ids: Vec<i64> = targets.iter().map(|t| t.id).collect();
    info!(targets = ids.len(), "starting sync cycle");
    syncer.sync_many(&ids, cancel).await?;
    info!("sync cycle completed");
    Ok(())
}

async fn cleanup_loop(cleanup: CleanupService, cancel: CancellationToken) {
    info!("cleanup scheduler started with daily interval");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(CLEANUP_INITIAL_DELAY) => {}
    }
    if let Err(e) = cleanup.run(&cancel).await {
        error!(error = %e, "initial cleanup failed");
    }

    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + CLEANUP_INTERVAL,
        CLEANUP_INTERVAL,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("cleanup scheduler stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = cleanup.run(&cancel).await {
                    error!(error = %e, "scheduled cleanup failed");
                }
            }
        }
    }
}
