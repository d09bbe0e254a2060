use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter};
use tokio_rusqlite::Connection;

use super::targets::parse_column;
use crate::core::models::{Job, JobOperation, JobStatus, JobWithTarget};
use crate::error::{Result, SyncError};

/// Create a job in `pending`. Returns the new job id.
pub async fn create(
    conn: &Connection,
    target_id: Option<i64>,
    operation: JobOperation,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id = conn
        .call(move |c| {
            c.execute(
                "INSERT INTO jobs (target_id, operation, status, created_at)
                 VALUES (?1, ?2, 'pending', ?3)",
                params![target_id, operation.as_str(), now],
            )?;
            Ok(c.last_insert_rowid())
        })
        .await?;
    Ok(id)
}

/// Move a job along the state machine, updating its message.
///
/// `started_at` is recorded once, on the first transition into `running`;
/// `completed_at` on the transition into a terminal state. A job already in
/// a terminal state is immutable: the update matches zero rows and this
/// returns [`SyncError::JobTransition`].
pub async fn update_status(
    conn: &Connection,
    id: i64,
    status: JobStatus,
    message: Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    let changed = conn
        .call(move |c| {
            let n = c.execute(
                "UPDATE jobs SET
                     status = ?2,
                     message = COALESCE(?3, message),
                     started_at = CASE
                         WHEN ?2 = 'running' THEN COALESCE(started_at, ?4)
                         ELSE started_at
                     END,
                     completed_at = CASE
                         WHEN ?2 IN ('completed', 'failed') THEN ?4
                         ELSE completed_at
                     END
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
                params![id, status.as_str(), message, now],
            )?;
            Ok(n)
        })
        .await?;

    if changed == 0 {
        return Err(SyncError::JobTransition(id));
    }
    Ok(())
}

pub async fn get(conn: &Connection, id: i64) -> Result<Option<Job>> {
    let job = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT id, target_id, operation, status, message,
                        started_at, completed_at, created_at
                 FROM jobs WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![id], job_from_row)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
        .await?;
    Ok(job)
}

/// The most recent jobs, newest first, with the target name resolved when
/// the target still exists.
pub async fn list_latest(conn: &Connection, limit: u32) -> Result<Vec<JobWithTarget>> {
    let jobs = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT j.id, j.target_id, j.operation, j.status, j.message,
                        j.started_at, j.completed_at, j.created_at, t.name
                 FROM jobs j
                 LEFT JOIN targets t ON t.id = j.target_id
                 ORDER BY j.created_at DESC, j.id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(JobWithTarget {
                    job: job_from_row(row)?,
                    target_name: row.get(8)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await?;
    Ok(jobs)
}

pub async fn count_by_status(conn: &Connection, status: JobStatus) -> Result<u64> {
    let count = conn
        .call(move |c| {
            let n: i64 = c.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n)
        })
        .await?;
    Ok(count as u64)
}

/// Ids of jobs created before `cutoff`, oldest first, capped at `limit`.
/// Used by the retention cleaner to delete in bounded batches.
pub async fn ids_older_than(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<i64>> {
    let ids = conn
        .call(move |c| {
            let mut stmt = c.prepare(
                "SELECT id FROM jobs WHERE created_at < ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![cutoff, limit], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
        })
        .await?;
    Ok(ids)
}

pub async fn delete_by_ids(conn: &Connection, ids: Vec<i64>) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let deleted = conn
        .call(move |c| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let sql = format!("DELETE FROM jobs WHERE id IN ({placeholders})");
            let n = c.execute(&sql, params_from_iter(ids.iter()))?;
            Ok(n)
        })
        .await?;
    Ok(deleted as u64)
}

#[derive(Debug, Clone, Default)]
pub struct JobStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

pub async fn stats(conn: &Connection) -> Result<JobStats> {
    let stats = conn
        .call(|c| {
            let mut stats = JobStats::default();

            let mut stmt = c.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                let count = count as u64;
                stats.total += count;
                match JobStatus::parse(&status) {
                    Some(JobStatus::Pending) => stats.pending = count,
                    Some(JobStatus::Running) => stats.running = count,
                    Some(JobStatus::Completed) => stats.completed = count,
                    Some(JobStatus::Failed) => stats.failed = count,
                    None => {}
                }
            }

            stats.oldest = c
                .query_row("SELECT MIN(created_at) FROM jobs", [], |row| row.get(0))?;
            stats.newest = c
                .query_row("SELECT MAX(created_at) FROM jobs", [], |row| row.get(0))?;

            Ok(stats)
        })
        .await?;
    Ok(stats)
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let operation: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Job {
        id: row.get(0)?,
        target_id: row.get(1)?,
        operation: parse_column(2, &operation, JobOperation::parse)?,
        status: parse_column(3, &status, JobStatus::parse)?,
        message: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn job_lifecycle_timestamps_are_monotonic() {
        let conn = db::open_in_memory().await.unwrap();
        let t0 = Utc::now();

        let id = create(&conn, None, JobOperation::Backup, t0).await.unwrap();
        let job = get(&conn, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());

        let t1 = t0 + chrono::Duration::seconds(1);
        update_status(&conn, id, JobStatus::Running, Some("creating archive".into()), t1)
            .await
            .unwrap();

        let t2 = t1 + chrono::Duration::seconds(1);
        update_status(&conn, id, JobStatus::Completed, Some("done".into()), t2)
            .await
            .unwrap();

        let job = get(&conn, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let started = job.started_at.unwrap();
        let completed = job.completed_at.unwrap();
        assert!(job.created_at <= started);
        assert!(started <= completed);
    }

    #[tokio::test]
    async fn started_at_is_recorded_once() {
        let conn = db::open_in_memory().await.unwrap();
        let t0 = Utc::now();
        let id = create(&conn, None, JobOperation::Backup, t0).await.unwrap();

        let t1 = t0 + chrono::Duration::seconds(1);
        update_status(&conn, id, JobStatus::Running, Some("uploading".into()), t1)
            .await
            .unwrap();
        let t2 = t1 + chrono::Duration::seconds(5);
        update_status(&conn, id, JobStatus::Running, Some("retry 1/3".into()), t2)
            .await
            .unwrap();

        let job = get(&conn, id).await.unwrap().unwrap();
        assert_eq!(job.started_at.unwrap(), t1);
        assert_eq!(job.message.as_deref(), Some("retry 1/3"));
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let conn = db::open_in_memory().await.unwrap();
        let now = Utc::now();
        let id = create(&conn, None, JobOperation::Backup, now).await.unwrap();

        update_status(&conn, id, JobStatus::Running, None, now).await.unwrap();
        update_status(&conn, id, JobStatus::Failed, Some("upload failed".into()), now)
            .await
            .unwrap();

        let reopened =
            update_status(&conn, id, JobStatus::Running, Some("again".into()), now).await;
        assert!(matches!(reopened, Err(SyncError::JobTransition(_))));

        let job = get(&conn, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message.as_deref(), Some("upload failed"));
    }

    #[tokio::test]
    async fn list_latest_joins_target_names() {
        let conn = db::open_in_memory().await.unwrap();
        let now = Utc::now();

        let target_id = db::targets::create(
            &conn,
            "alpha".into(),
            crate::core::models::TargetConfig::Webdav(crate::core::models::WebDavConfig {
                url: "https://dav.example.com".into(),
                username: "u".into(),
                password: "p".into(),
            }),
            now,
        )
        .await
        .unwrap();

        create(&conn, Some(target_id), JobOperation::Backup, now)
            .await
            .unwrap();
        create(&conn, None, JobOperation::Restore, now + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let jobs = list_latest(&conn, 10).await.unwrap();
        assert_eq!(jobs.len(), 2);
        // Newest first; the restore has no target.
        assert_eq!(jobs[0].job.operation, JobOperation::Restore);
        assert!(jobs[0].target_name.is_none());
        assert_eq!(jobs[1].target_name.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn jobs_survive_target_deletion() {
        let conn = db::open_in_memory().await.unwrap();
        let now = Utc::now();

        let target_id = db::targets::create(
            &conn,
            "doomed".into(),
            crate::core::models::TargetConfig::Webdav(crate::core::models::WebDavConfig {
                url: "https://dav.example.com".into(),
                username: "u".into(),
                password: "p".into(),
            }),
            now,
        )
        .await
        .unwrap();
        let job_id = create(&conn, Some(target_id), JobOperation::Backup, now)
            .await
            .unwrap();

        db::targets::delete(&conn, target_id).await.unwrap();

        let job = get(&conn, job_id).await.unwrap().unwrap();
        assert!(job.target_id.is_none());
        let jobs = list_latest(&conn, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].target_name.is_none());
    }

    #[tokio::test]
    async fn batched_deletion_by_age() {
        let conn = db::open_in_memory().await.unwrap();
        let now = Utc::now();

        for days_ago in [0i64, 10, 40] {
            create(
                &conn,
                None,
                JobOperation::Backup,
                now - chrono::Duration::days(days_ago),
            )
            .await
            .unwrap();
        }

        let cutoff = now - chrono::Duration::days(30);
        let ids = ids_older_than(&conn, cutoff, 1000).await.unwrap();
        assert_eq!(ids.len(), 1);

        let deleted = delete_by_ids(&conn, ids).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = list_latest(&conn, 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }
}
