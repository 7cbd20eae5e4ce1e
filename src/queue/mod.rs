//! Durable job queue
//!
//! Jobs live in the same SQLite file as everything else. Claiming is a
//! single transaction (select oldest eligible, flip to running) so two
//! concurrent claimers can never pick the same job. Failures either
//! reschedule with exponential backoff or copy the job into the
//! dead-letter table for manual re-drive.

pub mod job;

pub use job::{DeadLetterEntry, Job, JobPayload, JobStatus, JobType};

use crate::store::types::{new_id, now_rfc3339};
use crate::store::Store;
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

const JOB_COLUMNS: &str = "id, event_id, job_type, status, payload, attempts, max_attempts, \
     run_at, created_at, started_at, completed_at, cancelled_at, cancelled_by, error_message";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let job_type: String = row.get("job_type")?;
    let status: String = row.get("status")?;
    Ok(Job {
        id: row.get("id")?,
        event_id: row.get("event_id")?,
        job_type: JobType::parse(&job_type).unwrap_or(JobType::TtlCleanup),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        payload: row.get("payload")?,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        run_at: row.get("run_at")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        cancelled_at: row.get("cancelled_at")?,
        cancelled_by: row.get("cancelled_by")?,
        error_message: row.get("error_message")?,
    })
}

/// Options for [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub max_attempts: Option<i64>,
    pub delay_ms: Option<i64>,
}

/// Per-status counts plus the dead-letter backlog.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub by_status: HashMap<String, i64>,
    pub dead_letter: i64,
}

pub struct JobQueue {
    store: Arc<Store>,
}

impl JobQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Schedule a new job. `delay_ms` shifts the earliest run time into
    /// the future; the job is visible to `claim` once `run_at <= now`.
    pub fn enqueue(
        &self,
        event_id: Option<&str>,
        payload: &JobPayload,
        opts: EnqueueOptions,
    ) -> Result<Job> {
        let id = new_id();
        let now = Utc::now();
        let created_at = now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let run_at = (now + Duration::milliseconds(opts.delay_ms.unwrap_or(0)))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let max_attempts = opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1);
        let payload_json = serde_json::to_string(payload)?;

        self.store.writer().execute(
            "INSERT INTO jobs (id, event_id, job_type, status, payload, attempts, max_attempts,
                               run_at, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, ?6, ?7)",
            params![
                id,
                event_id,
                payload.job_type().as_str(),
                payload_json,
                max_attempts,
                run_at,
                created_at
            ],
        )?;

        tracing::debug!(job_id = %id, job_type = payload.job_type().as_str(), "Enqueued job");
        self.get(&id)?.ok_or_else(|| anyhow!("job {} vanished after insert", id))
    }

    /// Atomically claim the oldest runnable job, if any. The select and
    /// the flip to `running` happen inside one transaction.
    pub fn claim(&self) -> Result<Option<Job>> {
        let mut conn = self.store.writer();
        let tx = conn.transaction()?;
        let now = now_rfc3339();

        let claimed: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE status IN ('pending', 'retry') AND run_at <= ?1
                 ORDER BY created_at ASC LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = claimed else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs
             SET status = 'running', started_at = ?1, attempts = attempts + 1
             WHERE id = ?2",
            params![now, id],
        )?;

        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            row_to_job,
        )?;
        tx.commit()?;

        Ok(Some(job))
    }

    pub fn complete(&self, id: &str, result: Option<&serde_json::Value>) -> Result<()> {
        let affected = self.store.writer().execute(
            "UPDATE jobs SET status = 'completed', completed_at = ?1, error_message = ?2
             WHERE id = ?3 AND status = 'running'",
            params![now_rfc3339(), result.map(|v| v.to_string()), id],
        )?;
        if affected == 0 {
            return Err(anyhow!("job {} is not running", id));
        }
        Ok(())
    }

    /// Fail a running job. Retryable failures with budget left go back to
    /// `retry` with `run_at = now + 2^(attempts-1)` minutes; everything
    /// else becomes `failed` and is copied to the dead-letter table.
    pub fn fail(&self, id: &str, message: &str, retryable: bool) -> Result<Job> {
        let mut conn = self.store.writer();
        let tx = conn.transaction()?;

        let job = tx
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| anyhow!("no such job: {}", id))?;

        if retryable && job.attempts < job.max_attempts {
            let delay_minutes = backoff_minutes(job.attempts);
            let run_at = (Utc::now() + Duration::minutes(delay_minutes))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            tx.execute(
                "UPDATE jobs SET status = 'retry', run_at = ?1, error_message = ?2 WHERE id = ?3",
                params![run_at, message, id],
            )?;
            tx.commit()?;
            tracing::warn!(
                job_id = %id,
                attempt = job.attempts,
                delay_minutes,
                "Job failed, scheduled retry: {}",
                message
            );
        } else {
            let reason = if retryable {
                "max attempts exhausted"
            } else {
                "non-retryable failure"
            };
            tx.execute(
                "UPDATE jobs SET status = 'failed', completed_at = ?1, error_message = ?2
                 WHERE id = ?3",
                params![now_rfc3339(), message, id],
            )?;
            tx.execute(
                "INSERT INTO dead_letter_jobs
                     (id, job_id, event_id, job_type, status, payload, attempts,
                      error_message, reason, dead_lettered_at)
                 VALUES (?1, ?2, ?3, ?4, 'dead_letter', ?5, ?6, ?7, ?8, ?9)",
                params![
                    new_id(),
                    job.id,
                    job.event_id,
                    job.job_type.as_str(),
                    job.payload,
                    job.attempts,
                    message,
                    reason,
                    now_rfc3339()
                ],
            )?;
            tx.commit()?;
            tracing::error!(job_id = %id, reason, "Job dead-lettered: {}", message);
        }

        self.get(id)?.ok_or_else(|| anyhow!("job {} vanished", id))
    }

    /// Cancel a job that has not started; running jobs finish on their
    /// own and are reined in by the runner's shutdown handles instead.
    pub fn cancel(&self, id: &str, by: &str) -> Result<bool> {
        let affected = self.store.writer().execute(
            "UPDATE jobs SET status = 'cancelled', cancelled_at = ?1, cancelled_by = ?2
             WHERE id = ?3 AND status IN ('pending', 'retry')",
            params![now_rfc3339(), by, id],
        )?;
        Ok(affected > 0)
    }

    /// Delete terminal jobs older than the cutoff. Idempotent.
    pub fn purge_old_jobs(&self, older_than_days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(older_than_days))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let deleted = self.store.writer().execute(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND COALESCE(completed_at, cancelled_at, created_at) < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.store.reader()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn jobs_for_event(&self, event_id: &str) -> Result<Vec<Job>> {
        let conn = self.store.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE event_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![event_id], row_to_job)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Whether the event still has an extract/reprocess waiting or
    /// running (used to gate the `completed` invariant).
    pub fn has_open_extract_jobs(&self, event_id: &str) -> Result<bool> {
        let conn = self.store.reader()?;
        let open: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM jobs
             WHERE event_id = ?1
               AND job_type IN ('extract', 'reprocess')
               AND status IN ('pending', 'retry', 'running')",
            params![event_id],
            |row| row.get(0),
        )?;
        Ok(open)
    }

    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let conn = self.store.reader()?;
        let mut out = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1
                     ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![s.as_str(), limit as i64], row_to_job)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], row_to_job)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let conn = self.store.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, event_id, job_type, payload, attempts, error_message, reason,
                    dead_lettered_at
             FROM dead_letter_jobs ORDER BY dead_lettered_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let job_type: String = row.get(3)?;
            Ok(DeadLetterEntry {
                id: row.get(0)?,
                job_id: row.get(1)?,
                event_id: row.get(2)?,
                job_type: JobType::parse(&job_type).unwrap_or(JobType::TtlCleanup),
                payload: row.get(4)?,
                attempts: row.get(5)?,
                error_message: row.get(6)?,
                reason: row.get(7)?,
                dead_lettered_at: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Re-drive a dead-letter entry as a fresh pending job with the
    /// original payload and a full attempt budget.
    pub fn retry_dead_letter(&self, dead_letter_id: &str) -> Result<Job> {
        let entry = {
            let conn = self.store.reader()?;
            conn.query_row(
                "SELECT job_id, event_id, job_type, payload, attempts FROM dead_letter_jobs
                 WHERE id = ?1",
                params![dead_letter_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| anyhow!("no such dead-letter entry: {}", dead_letter_id))?
        };

        let (_, event_id, job_type, payload) = entry;
        let payload: JobPayload = serde_json::from_str(
            payload
                .as_deref()
                .ok_or_else(|| anyhow!("dead-letter entry {} has no payload", dead_letter_id))?,
        )?;
        debug_assert_eq!(Some(payload.job_type()), JobType::parse(&job_type));

        self.enqueue(event_id.as_deref(), &payload, EnqueueOptions::default())
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.store.reader()?;
        let mut by_status = HashMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            by_status.insert(status, count);
        }
        let dead_letter: i64 =
            conn.query_row("SELECT COUNT(*) FROM dead_letter_jobs", [], |row| row.get(0))?;
        Ok(QueueStats {
            by_status,
            dead_letter,
        })
    }
}

/// Parse a stored RFC 3339 timestamp.
#[cfg(test)]
pub fn parse_ts(s: &str) -> Option<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Exponential backoff: 1, 2, 4, 8, ... minutes per attempt, capped so
/// the shift cannot overflow.
fn backoff_minutes(attempt: i64) -> i64 {
    1i64 << (attempt - 1).clamp(0, 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (tempfile::TempDir, Arc<Store>, JobQueue) {
        let (dir, store) = Store::open_temp().unwrap();
        let store = Arc::new(store);
        let queue = JobQueue::new(store.clone());
        (dir, store, queue)
    }

    fn stt_payload() -> JobPayload {
        JobPayload::Stt {
            audio_path: "/tmp/a.ogg".into(),
            language: None,
        }
    }

    #[test]
    fn enqueue_claim_complete_walks_the_states() {
        let (_dir, _store, queue) = queue();
        let job = queue
            .enqueue(None, &stt_payload(), EnqueueOptions::default())
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);

        let claimed = queue.claim().unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());

        // The queue is drained; a second claim finds nothing.
        assert!(queue.claim().unwrap().is_none());

        queue
            .complete(&job.id, Some(&serde_json::json!({"ok": true})))
            .unwrap();
        let done = queue.get(&job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn delayed_jobs_are_invisible_until_due() {
        let (_dir, _store, queue) = queue();
        queue
            .enqueue(
                None,
                &stt_payload(),
                EnqueueOptions {
                    delay_ms: Some(60_000),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(queue.claim().unwrap().is_none());
    }

    #[test]
    fn claim_order_is_oldest_first() {
        let (_dir, _store, queue) = queue();
        let first = queue
            .enqueue(Some("e1"), &stt_payload(), EnqueueOptions::default())
            .unwrap();
        let second = queue
            .enqueue(Some("e2"), &stt_payload(), EnqueueOptions::default())
            .unwrap();

        assert_eq!(queue.claim().unwrap().unwrap().id, first.id);
        assert_eq!(queue.claim().unwrap().unwrap().id, second.id);
    }

    #[test]
    fn retryable_failure_backs_off_exponentially() {
        let (_dir, _store, queue) = queue();
        let job = queue
            .enqueue(None, &stt_payload(), EnqueueOptions::default())
            .unwrap();

        let mut delays = Vec::new();
        for _ in 0..2 {
            // Make the retry immediately claimable again by rewinding run_at.
            queue
                .store
                .writer()
                .execute(
                    "UPDATE jobs SET run_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                    params![job.id],
                )
                .unwrap();
            let claimed = queue.claim().unwrap().unwrap();
            let before = Utc::now();
            let failed = queue.fail(&claimed.id, "llm unreachable", true).unwrap();
            assert_eq!(failed.status, JobStatus::Retry);
            let run_at = parse_ts(&failed.run_at).unwrap();
            delays.push((run_at - before).num_seconds());
        }

        // 1 minute, then 2 minutes: strictly non-decreasing.
        assert!(delays[0] >= 55 && delays[0] <= 65, "got {:?}", delays);
        assert!(delays[1] >= 115 && delays[1] <= 125, "got {:?}", delays);
    }

    #[test]
    fn exhausted_retries_dead_letter_the_job() {
        let (_dir, _store, queue) = queue();
        let job = queue
            .enqueue(
                None,
                &stt_payload(),
                EnqueueOptions {
                    max_attempts: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();

        let claimed = queue.claim().unwrap().unwrap();
        let failed = queue.fail(&claimed.id, "still broken", true).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        let dlq = queue.list_dead_letters(10).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].job_id, job.id);
        assert_eq!(dlq[0].reason.as_deref(), Some("max attempts exhausted"));
    }

    #[test]
    fn non_retryable_failure_skips_retry_entirely() {
        let (_dir, _store, queue) = queue();
        let job = queue
            .enqueue(None, &stt_payload(), EnqueueOptions::default())
            .unwrap();
        queue.claim().unwrap().unwrap();
        let failed = queue.fail(&job.id, "audio file missing", false).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        let dlq = queue.list_dead_letters(10).unwrap();
        assert_eq!(dlq[0].reason.as_deref(), Some("non-retryable failure"));
    }

    #[test]
    fn cancel_only_touches_pending_and_retry() {
        let (_dir, _store, queue) = queue();
        let job = queue
            .enqueue(None, &stt_payload(), EnqueueOptions::default())
            .unwrap();
        assert!(queue.cancel(&job.id, "operator").unwrap());
        let cancelled = queue.get(&job.id).unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by.as_deref(), Some("operator"));

        // A running job cannot be cancelled at queue level.
        let job2 = queue
            .enqueue(None, &stt_payload(), EnqueueOptions::default())
            .unwrap();
        queue.claim().unwrap().unwrap();
        assert!(!queue.cancel(&job2.id, "operator").unwrap());
    }

    #[test]
    fn dead_letter_retry_re_enqueues_original_payload() {
        let (_dir, _store, queue) = queue();
        queue
            .enqueue(Some("ev"), &stt_payload(), EnqueueOptions::default())
            .unwrap();
        queue.claim().unwrap().unwrap();
        let failed = queue
            .fail(
                &queue.list_jobs(None, 1).unwrap()[0].id,
                "bad input",
                false,
            )
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        let dlq = queue.list_dead_letters(1).unwrap();
        let revived = queue.retry_dead_letter(&dlq[0].id).unwrap();
        assert_eq!(revived.status, JobStatus::Pending);
        assert_eq!(revived.event_id.as_deref(), Some("ev"));
        assert_eq!(revived.payload().unwrap(), stt_payload());
    }

    #[test]
    fn purge_removes_only_terminal_jobs() {
        let (_dir, _store, queue) = queue();
        let done = queue
            .enqueue(None, &stt_payload(), EnqueueOptions::default())
            .unwrap();
        queue.claim().unwrap().unwrap();
        queue.complete(&done.id, None).unwrap();
        // Backdate so the cutoff catches it.
        queue
            .store
            .writer()
            .execute(
                "UPDATE jobs SET completed_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                params![done.id],
            )
            .unwrap();

        let live = queue
            .enqueue(None, &stt_payload(), EnqueueOptions::default())
            .unwrap();

        assert_eq!(queue.purge_old_jobs(30).unwrap(), 1);
        // Idempotent: nothing more to remove.
        assert_eq!(queue.purge_old_jobs(30).unwrap(), 0);
        assert!(queue.get(&live.id).unwrap().is_some());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Successive retry delays are strictly non-decreasing.
            #[test]
            fn backoff_is_monotone(a in 1i64..100, b in 1i64..100) {
                prop_assume!(a <= b);
                prop_assert!(backoff_minutes(a) <= backoff_minutes(b));
            }

            /// Random op sequences never violate the job invariants:
            /// attempts within budget, retry implies budget left and a
            /// run time at or after creation, running implies a start
            /// time and at least one attempt.
            #[test]
            fn state_machine_invariants_hold(ops in proptest::collection::vec(0u8..5, 1..30)) {
                let (_dir, _store, queue) = queue();
                let mut running: Vec<String> = Vec::new();

                for op in ops {
                    match op {
                        0 => {
                            queue
                                .enqueue(None, &stt_payload(), EnqueueOptions::default())
                                .unwrap();
                        }
                        1 => {
                            if let Some(job) = queue.claim().unwrap() {
                                running.push(job.id);
                            }
                        }
                        2 => {
                            if let Some(id) = running.pop() {
                                queue.complete(&id, None).unwrap();
                            }
                        }
                        3 => {
                            if let Some(id) = running.pop() {
                                queue.fail(&id, "transient", true).unwrap();
                                // Make the retry claimable without moving
                                // run_at before created_at.
                                queue
                                    .store
                                    .writer()
                                    .execute(
                                        "UPDATE jobs SET run_at = created_at
                                         WHERE id = ?1 AND status = 'retry'",
                                        params![id],
                                    )
                                    .unwrap();
                            }
                        }
                        _ => {
                            if let Some(id) = running.pop() {
                                queue.fail(&id, "fatal", false).unwrap();
                            }
                        }
                    }

                    for job in queue.list_jobs(None, 1000).unwrap() {
                        prop_assert!(job.attempts >= 0 && job.attempts <= job.max_attempts);
                        match job.status {
                            JobStatus::Retry => {
                                prop_assert!(job.attempts < job.max_attempts);
                                prop_assert!(job.run_at >= job.created_at);
                            }
                            JobStatus::Running => {
                                prop_assert!(job.started_at.is_some());
                                prop_assert!(job.attempts >= 1);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn stats_count_per_status_and_dlq() {
        let (_dir, _store, queue) = queue();
        let job = queue
            .enqueue(None, &stt_payload(), EnqueueOptions::default())
            .unwrap();
        queue
            .enqueue(None, &stt_payload(), EnqueueOptions::default())
            .unwrap();
        // Oldest first: the claim picks `job`, which then dead-letters.
        queue.claim().unwrap().unwrap();
        queue.fail(&job.id, "boom", false).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.by_status.get("pending"), Some(&1));
        assert_eq!(stats.by_status.get("failed"), Some(&1));
        assert_eq!(stats.dead_letter, 1);
    }
}
