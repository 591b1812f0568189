//! Durable reconcile job queue (`reconcile_jobs`).
//!
//! Jobs are written in the same transaction as the hierarchy edit that
//! caused them. Delivery is at-least-once: a worker that dies mid-job
//! leaves the row `running`, and [`Database::requeue_running_jobs`] hands
//! it out again on the next start. Reconciliation is idempotent, so a
//! repeated job is harmless.

use chrono::{DateTime, Utc};
use pw_core::{JobStatus, ReconcileJob};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use turso::{params, Connection};

use crate::db::{finish_tx, first_row, parse_timestamp, timestamp, Database, DbError, Result};

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.done + self.failed
    }
}

const JOB_COLUMNS: &str = "id, coordinator_id, reason, status, attempts, last_error, \
                           enqueued_at, available_at, updated_at";

impl Database {
    /// Queue a reconcile job unless one is already pending for the coordinator.
    ///
    /// Returns the new job id, or `None` when an existing pending job covers it.
    pub async fn enqueue(&self, coordinator_id: &str, reason: &str) -> Result<Option<String>> {
        enqueue_in(&self.conn, coordinator_id, reason, Utc::now()).await
    }

    /// Claim up to `limit` runnable jobs, oldest first.
    ///
    /// Claimed jobs move to `running` with their attempt count bumped.
    pub async fn claim_jobs(&mut self, limit: usize) -> Result<Vec<ReconcileJob>> {
        let tx = self.conn.transaction().await?;
        let result: Result<Vec<ReconcileJob>> = async {
            let now = timestamp(Utc::now());
            let query = format!(
                r#"
                SELECT {} FROM reconcile_jobs
                WHERE status = ? AND available_at <= ?
                ORDER BY available_at ASC, enqueued_at ASC
                LIMIT ?
                "#,
                JOB_COLUMNS
            );

            let mut rows = tx
                .query(
                    &query,
                    params![JobStatus::Pending.as_str(), now.clone(), limit as i64],
                )
                .await?;
            let mut jobs = Vec::new();
            while let Some(row) = rows.next().await? {
                jobs.push(parse_job_row(&row)?);
            }
            drop(rows);

            let claimed_at = Utc::now();
            for job in &mut jobs {
                tx.execute(
                    r#"
                    UPDATE reconcile_jobs
                    SET status = ?, attempts = attempts + 1, updated_at = ?
                    WHERE id = ?
                    "#,
                    params![JobStatus::Running.as_str(), now.clone(), job.id.clone()],
                )
                .await?;
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.updated_at = claimed_at;
            }

            Ok(jobs)
        }
        .await;

        let jobs = finish_tx!(tx, result)?;
        if !jobs.is_empty() {
            debug!("Claimed {} reconcile jobs", jobs.len());
        }
        Ok(jobs)
    }

    /// Mark a claimed job as done.
    pub async fn complete_job(&self, job_id: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE reconcile_jobs SET status = ?, last_error = NULL, updated_at = ? WHERE id = ?",
                params![JobStatus::Done.as_str(), timestamp(Utc::now()), job_id],
            )
            .await?;

        if changed == 0 {
            return Err(DbError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// The job goes back to `pending` after `backoff * attempts`, or to
    /// `failed` once `max_attempts` is reached. Returns the new status.
    pub async fn fail_job(
        &self,
        job_id: &str,
        error: &str,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<JobStatus> {
        let job = self.get_job(job_id).await?;
        let now = Utc::now();

        let (status, available_at) = if job.attempts >= i64::from(max_attempts) {
            (JobStatus::Failed, job.available_at)
        } else {
            let factor = u32::try_from(job.attempts.max(1)).unwrap_or(u32::MAX);
            let delay = chrono::Duration::from_std(backoff.saturating_mul(factor))
                .map_err(|e| DbError::Other(format!("invalid retry backoff: {}", e)))?;
            (JobStatus::Pending, now + delay)
        };

        self.conn
            .execute(
                r#"
                UPDATE reconcile_jobs
                SET status = ?, last_error = ?, available_at = ?, updated_at = ?
                WHERE id = ?
                "#,
                params![
                    status.as_str(),
                    error,
                    timestamp(available_at),
                    timestamp(now),
                    job_id
                ],
            )
            .await?;

        match status {
            JobStatus::Failed => warn!(
                "Job {} for {} failed permanently after {} attempts: {}",
                job_id, job.coordinator_id, job.attempts, error
            ),
            _ => warn!(
                "Job {} for {} failed (attempt {}), retrying at {}: {}",
                job_id,
                job.coordinator_id,
                job.attempts,
                timestamp(available_at),
                error
            ),
        }

        Ok(status)
    }

    /// Hand one claimed job back to `pending` without counting a failure.
    ///
    /// Returns `false` when the job is missing or no longer `running`.
    pub async fn release_job(&self, job_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE reconcile_jobs SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
                params![
                    JobStatus::Pending.as_str(),
                    timestamp(Utc::now()),
                    job_id,
                    JobStatus::Running.as_str()
                ],
            )
            .await?;

        Ok(changed > 0)
    }

    /// Return jobs left `running` by a stopped worker to `pending`.
    pub async fn requeue_running_jobs(&self) -> Result<u64> {
        let requeued = self
            .conn
            .execute(
                "UPDATE reconcile_jobs SET status = ?, updated_at = ? WHERE status = ?",
                params![
                    JobStatus::Pending.as_str(),
                    timestamp(Utc::now()),
                    JobStatus::Running.as_str()
                ],
            )
            .await?;

        if requeued > 0 {
            warn!("Requeued {} interrupted reconcile jobs", requeued);
        }
        Ok(requeued)
    }

    /// Delete `done` jobs last touched more than `older_than` ago.
    ///
    /// Failed jobs stay for inspection. Returns the number of rows removed.
    pub async fn prune_done_jobs(&self, older_than: Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| DbError::Other(format!("invalid retention: {}", e)))?;
        let cutoff = timestamp(Utc::now() - age);

        let removed = self
            .conn
            .execute(
                "DELETE FROM reconcile_jobs WHERE status = ? AND updated_at < ?",
                params![JobStatus::Done.as_str(), cutoff],
            )
            .await?;

        if removed > 0 {
            debug!("Pruned {} finished reconcile jobs", removed);
        }
        Ok(removed)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<ReconcileJob> {
        let query = format!("SELECT {} FROM reconcile_jobs WHERE id = ?", JOB_COLUMNS);
        let rows = self.conn.query(&query, params![job_id]).await?;

        if let Some(row) = first_row(rows).await? {
            parse_job_row(&row)
        } else {
            Err(DbError::JobNotFound(job_id.to_string()))
        }
    }

    /// List jobs, newest first, optionally filtered by status (0 = no limit).
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<ReconcileJob>> {
        let mut query = format!("SELECT {} FROM reconcile_jobs", JOB_COLUMNS);
        let mut params_vec: Vec<turso::Value> = Vec::new();

        if let Some(status) = status {
            query.push_str(" WHERE status = ?");
            params_vec.push(status.as_str().to_string().into());
        }
        query.push_str(" ORDER BY enqueued_at DESC, id ASC");

        if limit > 0 {
            query.push_str(" LIMIT ?");
            params_vec.push((limit as i64).into());
        }

        let mut rows = self.conn.query(&query, params_vec).await?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(parse_job_row(&row)?);
        }

        Ok(jobs)
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM reconcile_jobs GROUP BY status",
                params![],
            )
            .await?;

        let mut counts = JobCounts::default();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => counts.pending = count,
                JobStatus::Running => counts.running = count,
                JobStatus::Done => counts.done = count,
                JobStatus::Failed => counts.failed = count,
            }
        }

        Ok(counts)
    }
}

/// Coalescing insert used by triggers and sweeps inside their transaction.
pub(crate) async fn enqueue_in(
    conn: &Connection,
    coordinator_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let rows = conn
        .query(
            "SELECT id FROM reconcile_jobs WHERE coordinator_id = ? AND status = ? LIMIT 1",
            params![coordinator_id, JobStatus::Pending.as_str()],
        )
        .await?;
    if let Some(row) = first_row(rows).await? {
        let existing: String = row.get(0)?;
        debug!("Job {} already pending for {}", existing, coordinator_id);
        return Ok(None);
    }

    let id = uuid::Uuid::new_v4().to_string();
    let stamp = timestamp(now);
    conn.execute(
        r#"
        INSERT INTO reconcile_jobs (
            id, coordinator_id, reason, status, attempts,
            enqueued_at, available_at, updated_at
        ) VALUES (?, ?, ?, ?, 0, ?, ?, ?)
        "#,
        params![
            id.clone(),
            coordinator_id,
            reason,
            JobStatus::Pending.as_str(),
            stamp.clone(),
            stamp.clone(),
            stamp
        ],
    )
    .await?;

    debug!("Enqueued job {} for {} ({})", id, coordinator_id, reason);
    Ok(Some(id))
}

fn parse_job_row(row: &turso::Row) -> Result<ReconcileJob> {
    let status: String = row.get(3)?;
    let enqueued_at: String = row.get(6)?;
    let available_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(ReconcileJob {
        id: row.get(0)?,
        coordinator_id: row.get(1)?,
        reason: row.get(2)?,
        status: status.parse()?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        enqueued_at: parse_timestamp(&enqueued_at, "enqueued_at")?,
        available_at: parse_timestamp(&available_at, "available_at")?,
        updated_at: parse_timestamp(&updated_at, "updated_at")?,
    })
}
