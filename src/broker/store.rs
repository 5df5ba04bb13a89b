//! Durable job storage
//!
//! Jobs live in the same `SQLite` file as the rest of the system. Claims
//! run inside an immediate transaction so concurrent workers never take
//! the same job twice.

use chrono::{Duration, Utc};
use rusqlite::TransactionBehavior;
use uuid::Uuid;

use crate::db::{parse_datetime, DbPool};
use crate::jobs::{Job, QueueKind};
use crate::{Error, Result};

/// Backoff schedule for retryable failures: base doubles per attempt
const RETRY_BASE_SECS: i64 = 5;

/// Per-queue job counts, reported by the health endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueCounts {
    pub queue: QueueKind,
    pub ready: u32,
    pub active: u32,
    pub failed: u32,
    pub dead: u32,
}

/// A job that exhausted its retries
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub queue: QueueKind,
    pub job_id: String,
    pub tenant_id: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

/// Broker storage over the shared pool
#[derive(Clone)]
pub struct JobStore {
    pool: DbPool,
}

impl JobStore {
    /// Create a new job store
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Enqueue a job, optionally delayed
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn enqueue(&self, job: &Job, delay: Option<std::time::Duration>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now();
        let run_at = delay.map_or(now, |d| {
            now + Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        });

        conn.execute(
            "INSERT INTO jobs (id, queue, tenant_id, payload, max_attempts, run_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                job.id,
                job.queue.as_str(),
                job.tenant_id,
                job.payload.to_string(),
                job.max_attempts,
                run_at.to_rfc3339(),
                now.to_rfc3339()
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::debug!(job_id = %job.id, queue = %job.queue, "job enqueued");
        Ok(())
    }

    /// Claim the next due job on a queue, marking it active and bumping
    /// its attempt counter. Returns `None` when the queue is idle.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn claim_next(&self, queue: QueueKind) -> Result<Option<Job>> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        let row = tx
            .query_row(
                "SELECT id, tenant_id, payload, attempts, max_attempts, enqueued_at
                 FROM jobs
                 WHERE queue = ?1 AND status IN ('ready', 'failed') AND run_at <= ?2
                 ORDER BY run_at ASC
                 LIMIT 1",
                [queue.as_str(), now.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| {
                if e == rusqlite::Error::QueryReturnedNoRows {
                    Ok(None)
                } else {
                    Err(Error::Database(e.to_string()))
                }
            })?;

        let Some((id, tenant_id, payload, attempts, max_attempts, enqueued_at)) = row else {
            tx.commit().map_err(|e| Error::Database(e.to_string()))?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = 'active', attempts = attempts + 1, claimed_at = ?2
             WHERE id = ?1",
            [id.as_str(), now.as_str()],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        Ok(Some(Job {
            id,
            queue,
            tenant_id,
            payload: serde_json::from_str(&payload)?,
            attempts: attempts + 1,
            max_attempts,
            enqueued_at: parse_datetime(&enqueued_at),
        }))
    }

    /// Mark an active job completed
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn complete(&self, job_id: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE jobs SET status = 'completed', progress = 100, finished_at = ?2 WHERE id = ?1",
            [job_id, Utc::now().to_rfc3339().as_str()],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Record a retryable failure. The job is rescheduled with exponential
    /// backoff while attempts remain, otherwise it is dead-lettered.
    /// Returns true when the job went to the dead-letter table.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn fail(&self, job: &Job, error: &str) -> Result<bool> {
        if job.attempts >= job.max_attempts {
            self.send_to_dlq(job, error)?;
            return Ok(true);
        }

        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let backoff = RETRY_BASE_SECS << (job.attempts.saturating_sub(1).min(10));
        let run_at = (Utc::now() + Duration::seconds(backoff)).to_rfc3339();

        conn.execute(
            "UPDATE jobs SET status = 'failed', run_at = ?2, last_error = ?3 WHERE id = ?1",
            [job.id.as_str(), run_at.as_str(), error],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::warn!(
            job_id = %job.id,
            queue = %job.queue,
            attempt = job.attempts,
            backoff_secs = backoff,
            "job failed, rescheduled"
        );
        Ok(false)
    }

    /// Dead-letter a job regardless of remaining attempts
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn send_to_dlq(&self, job: &Job, error: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE jobs SET status = 'dead', finished_at = ?2, last_error = ?3 WHERE id = ?1",
            [job.id.as_str(), now.as_str(), error],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO dead_letters (id, queue, job_id, tenant_id, payload, error, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                job.queue.as_str(),
                job.id,
                job.tenant_id,
                job.payload.to_string(),
                error,
                now
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::error!(job_id = %job.id, queue = %job.queue, error, "job dead-lettered");
        Ok(())
    }

    /// Update a long-running job's progress percentage
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_progress(&self, job_id: &str, progress: u8) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE jobs SET progress = ?2 WHERE id = ?1",
            rusqlite::params![job_id, progress.min(100)],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Store a job's outcome summary on its row
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_result(&self, job_id: &str, result: &serde_json::Value) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE jobs SET result = ?2 WHERE id = ?1",
            [job_id, result.to_string().as_str()],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Fetch a job's stored outcome summary, if any
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn job_result(&self, job_id: &str) -> Result<Option<serde_json::Value>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let raw = conn
            .query_row(
                "SELECT result FROM jobs WHERE id = ?1",
                [job_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .or_else(|e| {
                if e == rusqlite::Error::QueryReturnedNoRows {
                    Ok(None)
                } else {
                    Err(Error::Database(e.to_string()))
                }
            })?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Put jobs claimed before the cutoff back on the queue. A worker that
    /// crashed mid-job never completes or fails its claim, so stale active
    /// rows are the crash's leftovers. Returns how many were requeued.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn requeue_stale(&self, queue: QueueKind, older_than: std::time::Duration) -> Result<u32> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let cutoff = (Utc::now()
            - Duration::seconds(i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX)))
        .to_rfc3339();

        let requeued = conn
            .execute(
                "UPDATE jobs SET status = 'ready', claimed_at = NULL
                 WHERE queue = ?1 AND status = 'active' AND claimed_at <= ?2",
                [queue.as_str(), cutoff.as_str()],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let requeued = u32::try_from(requeued).unwrap_or(u32::MAX);
        if requeued > 0 {
            tracing::warn!(queue = %queue, count = requeued, "stale active jobs requeued");
        }
        Ok(requeued)
    }

    /// Requeue every dead-lettered job on a queue with a fresh attempt
    /// budget. Returns how many were requeued.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn retry_dead(&self, queue: QueueKind) -> Result<u32> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        let requeued = tx
            .execute(
                "UPDATE jobs SET status = 'ready', attempts = 0, run_at = ?2,
                        claimed_at = NULL, finished_at = NULL, last_error = NULL
                 WHERE queue = ?1 AND status = 'dead'",
                [queue.as_str(), now.as_str()],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.execute(
            "DELETE FROM dead_letters WHERE queue = ?1",
            [queue.as_str()],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        let requeued = u32::try_from(requeued).unwrap_or(u32::MAX);
        if requeued > 0 {
            tracing::info!(queue = %queue, count = requeued, "dead jobs requeued");
        }
        Ok(requeued)
    }

    /// Delete finished jobs older than the retention window. Dead letters
    /// are kept. Returns how many rows were removed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn clean_old(&self, older_than: std::time::Duration) -> Result<u32> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let cutoff = (Utc::now()
            - Duration::seconds(i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX)))
        .to_rfc3339();

        let removed = conn
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'dead') AND finished_at < ?1",
                [cutoff.as_str()],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Make a backed-off job immediately claimable again
    #[cfg(test)]
    pub(crate) fn rewind_backoff(&self, job_id: &str) {
        let conn = self.pool.get().unwrap();
        let past = (Utc::now() - Duration::seconds(1)).to_rfc3339();
        conn.execute("UPDATE jobs SET run_at = ?2 WHERE id = ?1", [job_id, past.as_str()])
            .unwrap();
    }

    /// Pretend a claim happened in the past
    #[cfg(test)]
    pub(crate) fn backdate_claim(&self, job_id: &str, secs: i64) {
        let conn = self.pool.get().unwrap();
        let past = (Utc::now() - Duration::seconds(secs)).to_rfc3339();
        conn.execute("UPDATE jobs SET claimed_at = ?2 WHERE id = ?1", [job_id, past.as_str()])
            .unwrap();
    }

    /// List dead letters, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn dead_letters(&self, queue: Option<QueueKind>) -> Result<Vec<DeadLetter>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, queue, job_id, tenant_id, payload, error, failed_at
                 FROM dead_letters
                 WHERE (?1 IS NULL OR queue = ?1)
                 ORDER BY failed_at DESC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let rows = stmt
            .query_map([queue.map(QueueKind::as_str)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .filter_map(|(id, queue, job_id, tenant_id, payload, error, failed_at)| {
                Some(DeadLetter {
                    id,
                    queue: QueueKind::from_str(&queue)?,
                    job_id,
                    tenant_id,
                    payload: serde_json::from_str(&payload).ok()?,
                    error,
                    failed_at: parse_datetime(&failed_at),
                })
            })
            .collect();

        Ok(rows)
    }

    /// Per-queue job counts across all queues
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn counts(&self) -> Result<Vec<QueueCounts>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut out = Vec::with_capacity(QueueKind::ALL.len());
        for queue in QueueKind::ALL {
            let (ready, active, failed, dead) = conn
                .query_row(
                    "SELECT
                        SUM(CASE WHEN status = 'ready' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'dead' THEN 1 ELSE 0 END)
                     FROM jobs WHERE queue = ?1",
                    [queue.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, Option<u32>>(0)?.unwrap_or(0),
                            row.get::<_, Option<u32>>(1)?.unwrap_or(0),
                            row.get::<_, Option<u32>>(2)?.unwrap_or(0),
                            row.get::<_, Option<u32>>(3)?.unwrap_or(0),
                        ))
                    },
                )
                .map_err(|e| Error::Database(e.to_string()))?;

            out.push(QueueCounts {
                queue,
                ready,
                active,
                failed,
                dead,
            });
        }
        out.sort_by_key(|c| c.queue.priority());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;
    use crate::jobs::MessageJob;

    fn message_job() -> Job {
        Job::new(
            QueueKind::Message,
            "org-1",
            &MessageJob {
                instance_id: "inst-1".to_owned(),
                message_id: "wamid-1".to_owned(),
                contact_phone: "5511988887777".to_owned(),
                contact_name: None,
                content: "oi".to_owned(),
                received_at: Utc::now(),
            },
        )
        .unwrap()
    }

    #[test]
    fn claim_marks_active_and_bumps_attempts() {
        let store = JobStore::new(init_memory().unwrap());
        let job = message_job();
        store.enqueue(&job, None).unwrap();

        let claimed = store.claim_next(QueueKind::Message).unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.attempts, 1);

        // already active, nothing more to claim
        assert!(store.claim_next(QueueKind::Message).unwrap().is_none());
    }

    #[test]
    fn delayed_jobs_are_not_claimable_early() {
        let store = JobStore::new(init_memory().unwrap());
        store
            .enqueue(&message_job(), Some(std::time::Duration::from_secs(3600)))
            .unwrap();
        assert!(store.claim_next(QueueKind::Message).unwrap().is_none());
    }

    #[test]
    fn fail_reschedules_then_dead_letters() {
        let store = JobStore::new(init_memory().unwrap());
        let job = message_job();
        store.enqueue(&job, None).unwrap();

        let mut claimed = store.claim_next(QueueKind::Message).unwrap().unwrap();
        assert!(!store.fail(&claimed, "socket closed").unwrap());

        // exhaust the budget
        claimed.attempts = claimed.max_attempts;
        assert!(store.fail(&claimed, "socket closed").unwrap());

        let dead = store.dead_letters(Some(QueueKind::Message)).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job_id, job.id);
    }

    #[test]
    fn failed_jobs_are_reclaimed_after_backoff() {
        let store = JobStore::new(init_memory().unwrap());
        let job = message_job();
        store.enqueue(&job, None).unwrap();

        let claimed = store.claim_next(QueueKind::Message).unwrap().unwrap();
        assert!(!store.fail(&claimed, "socket closed").unwrap());

        // the failed row shows up in the counts until the backoff elapses
        let counts = store.counts().unwrap();
        let message = counts.iter().find(|c| c.queue == QueueKind::Message).unwrap();
        assert_eq!(message.failed, 1);
        assert!(store.claim_next(QueueKind::Message).unwrap().is_none());

        store.rewind_backoff(&job.id);
        let reclaimed = store.claim_next(QueueKind::Message).unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[test]
    fn stale_active_jobs_are_requeued() {
        let store = JobStore::new(init_memory().unwrap());
        let job = message_job();
        store.enqueue(&job, None).unwrap();
        store.claim_next(QueueKind::Message).unwrap().unwrap();

        // a fresh claim is not stale
        let window = std::time::Duration::from_secs(300);
        assert_eq!(store.requeue_stale(QueueKind::Message, window).unwrap(), 0);

        // a claim from a worker that died is
        store.backdate_claim(&job.id, 600);
        assert_eq!(store.requeue_stale(QueueKind::Message, window).unwrap(), 1);
        let reclaimed = store.claim_next(QueueKind::Message).unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[test]
    fn job_result_round_trips() {
        let store = JobStore::new(init_memory().unwrap());
        let job = message_job();
        store.enqueue(&job, None).unwrap();

        assert!(store.job_result(&job.id).unwrap().is_none());
        store
            .set_result(&job.id, &serde_json::json!({"sent": 2, "failed": 1}))
            .unwrap();
        let result = store.job_result(&job.id).unwrap().unwrap();
        assert_eq!(result["sent"], 2);
    }

    #[test]
    fn retry_dead_requeues_with_fresh_budget() {
        let store = JobStore::new(init_memory().unwrap());
        let job = message_job();
        store.enqueue(&job, None).unwrap();
        store.send_to_dlq(&job, "boom").unwrap();

        assert_eq!(store.retry_dead(QueueKind::Message).unwrap(), 1);
        assert!(store.dead_letters(None).unwrap().is_empty());

        let claimed = store.claim_next(QueueKind::Message).unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);
    }

    #[test]
    fn clean_old_keeps_recent_jobs() {
        let store = JobStore::new(init_memory().unwrap());
        let job = message_job();
        store.enqueue(&job, None).unwrap();
        let claimed = store.claim_next(QueueKind::Message).unwrap().unwrap();
        store.complete(&claimed.id).unwrap();

        // finished just now, a day-long retention keeps it
        assert_eq!(store.clean_old(std::time::Duration::from_secs(86_400)).unwrap(), 0);
        assert_eq!(store.clean_old(std::time::Duration::ZERO).unwrap(), 1);
    }
}
