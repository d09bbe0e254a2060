//! Backup fan-out, restore, and health probing.
//!
//! Every attempted operation is recorded as a job in the ledger and driven
//! through the state machine pending → running → completed | failed. Workers
//! in a fan-out race freely under the concurrency cap; their jobs are
//! independent rows.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::core::archive::{Archive, ArchiveService};
use crate::core::models::{JobOperation, JobStatus, Target};
use crate::core::notifications::{JobEvent, NotificationChannel};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::db;
use crate::error::{Result, SyncError};
use crate::storage::{ConfigDriverFactory, DriverFactory, StorageDriver};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Syncer {
    db: Connection,
    archive: ArchiveService,
    factory: Arc<dyn DriverFactory>,
    policy: RetryPolicy,
    concurrency: usize,
    notifier: Option<Arc<dyn NotificationChannel>>,
    clock: Arc<dyn Clock>,
}

impl Syncer {
    pub fn new(
        db: Connection,
        archive: ArchiveService,
        policy: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            archive,
            factory: Arc::new(ConfigDriverFactory),
            policy,
            concurrency: concurrency.max(1),
            notifier: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_driver_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn NotificationChannel>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Back up to a single target, building a fresh archive unless an
    /// identically-named one already exists remotely.
    ///
    /// A missing or disabled target fails fast without creating a job.
    pub async fn sync_one(&self, target_id: i64, cancel: &CancellationToken) -> Result<()> {
        let target = self.load_enabled_target(target_id).await?;
        let job_id = db::jobs::create(
            &self.db,
            Some(target.id),
            JobOperation::Backup,
            self.clock.now(),
        )
        .await?;

        let span = info_span!("sync", job_id, target = %target.name);
        async {
            self.transition(job_id, JobStatus::Running, "creating archive")
                .await?;

            let driver = match self.factory.create(&target) {
                Ok(driver) => driver,
                Err(e) => {
                    return Err(self
                        .fail_job(
                            job_id,
                            &target,
                            JobOperation::Backup,
                            format!("failed to create storage driver: {e}"),
                            e,
                        )
                        .await);
                }
            };

            // Coarse deduplication: the filename is derived from the wall
            // second, so a sync landing in the same second as a finished one
            // has nothing new to upload.
            let filename = self.archive.filename_for(self.clock.now());
            match driver.exists(&filename, cancel).await {
                Ok(true) => {
                    let message = format!("backup already exists: {filename}");
                    self.transition(job_id, JobStatus::Completed, &message).await?;
                    info!(target = %target.name, filename = %filename, "reusing existing backup");
                    self.notify(JobEvent::Completed {
                        job_id,
                        target: target.name.clone(),
                        operation: JobOperation::Backup,
                        message,
                    });
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    return Err(self
                        .fail_job(
                            job_id,
                            &target,
                            JobOperation::Backup,
                            format!("failed to check existing backup: {e}"),
                            e,
                        )
                        .await);
                }
            }

            let archive = match self.build_archive().await {
                Ok(archive) => archive,
                Err(e) => {
                    return Err(self
                        .fail_job(
                            job_id,
                            &target,
                            JobOperation::Backup,
                            format!("failed to create backup: {e}"),
                            e,
                        )
                        .await);
                }
            };

            self.transition(job_id, JobStatus::Running, "uploading backup")
                .await?;
            self.upload_with_retry(job_id, &target, driver.as_ref(), &archive, cancel)
                .await
        }
        .instrument(span)
        .await
    }

    /// Back up to many targets concurrently, sharing one archive.
    ///
    /// Workers are bounded by the concurrency cap; every worker is awaited
    /// and failures are aggregated, so one bad target does not stop the rest.
    pub async fn sync_many(&self, target_ids: &[i64], cancel: &CancellationToken) -> Result<()> {
        if target_ids.is_empty() {
            return Err(SyncError::Config("no targets to sync".into()));
        }

        let archive = Arc::new(self.build_archive().await?);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();

        for &target_id in target_ids {
            let syncer = self.clone();
            let archive = archive.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();

            workers.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (target_id, Err(SyncError::Cancelled)),
                };
                let result = syncer.sync_with_archive(target_id, &archive, &cancel).await;
                (target_id, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((target_id, Err(e))) => {
                    failures.push(format!("target {target_id}: {e}"));
                }
                Err(e) => failures.push(format!("worker panicked: {e}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Fanout {
                failed: failures.len(),
                total: target_ids.len(),
                details: failures.join("; "),
            })
        }
    }

    /// The single-target path for one fan-out worker: same state machine,
    /// but the shared archive replaces construction and the existence check.
    async fn sync_with_archive(
        &self,
        target_id: i64,
        archive: &Archive,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = self.load_enabled_target(target_id).await?;
        let job_id = db::jobs::create(
            &self.db,
            Some(target.id),
            JobOperation::Backup,
            self.clock.now(),
        )
        .await?;

        let span = info_span!("sync", job_id, target = %target.name);
        async {
            self.transition(job_id, JobStatus::Running, "uploading backup")
                .await?;

            let driver = match self.factory.create(&target) {
                Ok(driver) => driver,
                Err(e) => {
                    return Err(self
                        .fail_job(
                            job_id,
                            &target,
                            JobOperation::Backup,
                            format!("failed to create storage driver: {e}"),
                            e,
                        )
                        .await);
                }
            };

            self.upload_with_retry(job_id, &target, driver.as_ref(), archive, cancel)
                .await
        }
        .instrument(span)
        .await
    }

    /// Restore a named archive from a target into `dest`. The target must
    /// exist but does not need to be enabled.
    pub async fn restore(
        &self,
        target_id: i64,
        filename: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = db::targets::get(&self.db, target_id)
            .await?
            .ok_or_else(|| SyncError::Config(format!("target {target_id} does not exist")))?;
        let job_id = db::jobs::create(
            &self.db,
            Some(target.id),
            JobOperation::Restore,
            self.clock.now(),
        )
        .await?;

        let span = info_span!("restore", job_id, target = %target.name, filename);
        async {
            self.transition(job_id, JobStatus::Running, "downloading backup")
                .await?;

            let driver = match self.factory.create(&target) {
                Ok(driver) => driver,
                Err(e) => {
                    return Err(self
                        .fail_job(
                            job_id,
                            &target,
                            JobOperation::Restore,
                            format!("failed to create storage driver: {e}"),
                            e,
                        )
                        .await);
                }
            };

            let max = self.policy.max_attempts;
            let download = with_retry(
                &self.policy,
                cancel,
                |attempt| {
                    let db = self.db.clone();
                    let now = self.clock.now();
                    async move {
                        let message = format!("retry {attempt}/{max}");
                        if let Err(e) =
                            db::jobs::update_status(&db, job_id, JobStatus::Running, Some(message), now)
                                .await
                        {
                            warn!(job_id, error = %e, "failed to record retry attempt");
                        }
                    }
                },
                || driver.download(filename, cancel),
            )
            .await;

            let data = match download {
                Ok(data) => data,
                Err(e) => {
                    return Err(self
                        .fail_job(
                            job_id,
                            &target,
                            JobOperation::Restore,
                            format!("download failed: {e}"),
                            e,
                        )
                        .await);
                }
            };

            self.transition(job_id, JobStatus::Running, "extracting backup")
                .await?;

            let service = self.archive.clone();
            let dest = dest.to_path_buf();
            let extracted = tokio::task::spawn_blocking(move || service.extract(&data, &dest))
                .await
                .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

            if let Err(e) = extracted {
                return Err(self
                    .fail_job(
                        job_id,
                        &target,
                        JobOperation::Restore,
                        format!("failed to extract backup: {e}"),
                        e,
                    )
                    .await);
            }

            let message = format!("restored from {filename}");
            self.transition(job_id, JobStatus::Completed, &message).await?;
            info!(target = %target.name, filename, "backup restored");
            self.notify(JobEvent::Completed {
                job_id,
                target: target.name.clone(),
                operation: JobOperation::Restore,
                message,
            });
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Probe every enabled target with a root listing under a short
    /// deadline. Returns target name → error message, `None` when healthy.
    pub async fn health_check_all(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Option<String>>> {
        let targets = db::targets::list_enabled(&self.db).await?;
        let mut results = HashMap::with_capacity(targets.len());

        for target in targets {
            let outcome = self.check_target(&target, cancel).await;
            if let Err(e) = &outcome {
                warn!(target = %target.name, error = %e, "health check failed");
            }
            results.insert(target.name, outcome.err().map(|e| e.to_string()));
        }

        if results.values().any(Option::is_some) {
            self.notify(JobEvent::HealthReport {
                results: results.clone(),
            });
        }
        Ok(results)
    }

    async fn check_target(&self, target: &Target, cancel: &CancellationToken) -> Result<()> {
        let driver = self.factory.create(target)?;
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, driver.list("", cancel)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Storage(format!(
                "health check timed out after {HEALTH_CHECK_TIMEOUT:?}"
            ))),
        }
    }

    async fn upload_with_retry(
        &self,
        job_id: i64,
        target: &Target,
        driver: &dyn StorageDriver,
        archive: &Archive,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let max = self.policy.max_attempts;
        let result = with_retry(
            &self.policy,
            cancel,
            |attempt| {
                let db = self.db.clone();
                let now = self.clock.now();
                async move {
                    let message = format!("retry {attempt}/{max}");
                    if let Err(e) =
                        db::jobs::update_status(&db, job_id, JobStatus::Running, Some(message), now)
                            .await
                    {
                        warn!(job_id, error = %e, "failed to record retry attempt");
                    }
                }
            },
            || driver.upload(&archive.filename, archive.bytes.clone(), cancel),
        )
        .await;

        match result {
            Ok(()) => {
                let message = format!("uploaded {}", archive.filename);
                self.transition(job_id, JobStatus::Completed, &message).await?;
                info!(target = %target.name, filename = %archive.filename, "backup synced");
                self.notify(JobEvent::Completed {
                    job_id,
                    target: target.name.clone(),
                    operation: JobOperation::Backup,
                    message,
                });
                Ok(())
            }
            Err(e) => Err(self
                .fail_job(
                    job_id,
                    target,
                    JobOperation::Backup,
                    format!("upload failed: {e}"),
                    e,
                )
                .await),
        }
    }

    async fn build_archive(&self) -> Result<Archive> {
        let service = self.archive.clone();
        let now = self.clock.now();
        tokio::task::spawn_blocking(move || service.build(now))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    }

    async fn load_enabled_target(&self, target_id: i64) -> Result<Target> {
        let target = db::targets::get(&self.db, target_id)
            .await?
            .ok_or_else(|| SyncError::Config(format!("target {target_id} does not exist")))?;
        if !target.enabled {
            return Err(SyncError::Config(format!(
                "target {} is disabled",
                target.name
            )));
        }
        Ok(target)
    }

    /// Record a terminal failure and hand the original error back.
    async fn fail_job(
        &self,
        job_id: i64,
        target: &Target,
        operation: JobOperation,
        message: String,
        error: SyncError,
    ) -> SyncError {
        if let Err(db_err) = self.transition(job_id, JobStatus::Failed, &message).await {
            error!(job_id, error = %db_err, "failed to record job failure");
        }
        self.notify(JobEvent::Failed {
            job_id,
            target: target.name.clone(),
            operation,
            error: message,
        });
        error
    }

    async fn transition(&self, job_id: i64, status: JobStatus, message: &str) -> Result<()> {
        db::jobs::update_status(
            &self.db,
            job_id,
            status,
            Some(message.to_string()),
            self.clock.now(),
        )
        .await
    }

    /// Notifications are best-effort and must not hold up the job.
    fn notify(&self, event: JobEvent) {
        if let Some(notifier) = &self.notifier {
            let notifier = notifier.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(event).await {
                    warn!(error = %e, "failed to send notification");
                }
            });
        }
    }
}
