//! Enrichment job queue
//!
//! Jobs live in the `enrichment_jobs` table. A partial UNIQUE index keeps at
//! most one queued or running job per key; enqueueing onto a live key merges
//! into the existing job instead of creating a second one.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::{format_datetime, parse_datetime, parse_enum, Database};
use crate::error::{Error, Result};
use crate::models::{EnrichmentJob, JobKind, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, job_key, kind, transaction_id, payload, status, attempts, \
     max_attempts, backoff_ms, not_before, leased_until, last_error, created_at, updated_at";

/// Longest backoff exponent; keeps the shift well inside u64
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Upper bound on a single retry delay (one day)
const MAX_RETRY_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

/// The queue key shared by every job for one transaction
pub fn job_key(transaction_id: i64) -> String {
    format!("enrich:{}", transaction_id)
}

/// What `enqueue_job` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was created
    Enqueued(i64),
    /// A live job already held the key and absorbed the request
    Merged(i64),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> i64 {
        match self {
            Self::Enqueued(id) | Self::Merged(id) => *id,
        }
    }
}

/// Where a failed job ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued for another attempt at this time
    Retrying(DateTime<Utc>),
    /// Terminal; no further attempts
    Failed,
}

impl Database {
    /// Put a job on the queue, or merge into the live job with the same key
    ///
    /// On merge the live job keeps its id and takes the earlier of the two
    /// `not_before` times. A job still waiting in the queue also takes the
    /// new payload, and an `Enrich` request upgrades a queued `RetryMatch`.
    pub fn enqueue_job(&self, job: &NewJob) -> Result<EnqueueOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = insert_or_merge_job(&tx, job)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Lease up to `limit` due jobs, marking them running
    ///
    /// Expired leases are returned to the queue first. Each leased job has
    /// its attempt counter incremented.
    pub fn lease_jobs(
        &self,
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: usize,
    ) -> Result<Vec<EnrichmentJob>> {
        self.requeue_expired_leases(now)?;

        let now_str = format_datetime(now);
        let leased_until = format_datetime(now + lease_duration);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id FROM enrichment_jobs
                WHERE status = 'queued' AND not_before <= ?
                ORDER BY not_before, id
                LIMIT ?
                "#,
            )?;
            let ids = stmt
                .query_map(params![now_str, limit as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                r#"
                UPDATE enrichment_jobs
                SET status = 'running', attempts = attempts + 1, leased_until = ?, updated_at = ?
                WHERE id = ?
                "#,
                params![leased_until, now_str, id],
            )?;
            let job = tx.query_row(
                &format!("SELECT {} FROM enrichment_jobs WHERE id = ?", JOB_COLUMNS),
                params![id],
                row_to_job,
            )?;
            jobs.push(job);
        }

        tx.commit()?;
        Ok(jobs)
    }

    /// Return running jobs whose lease has lapsed to the queue
    ///
    /// A job that has already used all its attempts is failed instead.
    pub fn requeue_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let now_str = format_datetime(now);

        let failed = conn.execute(
            r#"
            UPDATE enrichment_jobs
            SET status = 'failed', leased_until = NULL, last_error = 'lease expired', updated_at = ?1
            WHERE status = 'running' AND leased_until <= ?1 AND attempts >= max_attempts
            "#,
            params![now_str],
        )?;
        let requeued = conn.execute(
            r#"
            UPDATE enrichment_jobs
            SET status = 'queued', leased_until = NULL, not_before = ?1, updated_at = ?1
            WHERE status = 'running' AND leased_until <= ?1
            "#,
            params![now_str],
        )?;

        if failed + requeued > 0 {
            debug!(failed, requeued, "Reclaimed expired job leases");
        }
        Ok(requeued)
    }

    /// Mark a job as succeeded
    pub fn ack_job(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE enrichment_jobs
            SET status = 'succeeded', leased_until = NULL, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
            params![format_datetime(Utc::now()), id],
        )?;
        if updated == 0 {
            return Err(Error::Queue(format!("job {} is not running", id)));
        }
        Ok(())
    }

    /// Record a failed attempt
    ///
    /// A retryable failure with attempts left is requeued after
    /// `backoff_ms × 2^(attempts-1)`; anything else is terminal.
    pub fn fail_job(
        &self,
        id: i64,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (attempts, max_attempts, backoff_ms): (u32, u32, i64) = tx
            .query_row(
                "SELECT attempts, max_attempts, backoff_ms FROM enrichment_jobs WHERE id = ? AND status = 'running'",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| Error::Queue(format!("job {} is not running", id)))?;

        let now_str = format_datetime(now);
        let outcome = if retryable && attempts < max_attempts {
            let retry_at = now + retry_delay(backoff_ms.max(0) as u64, attempts);
            tx.execute(
                r#"
                UPDATE enrichment_jobs
                SET status = 'queued', leased_until = NULL, not_before = ?, last_error = ?, updated_at = ?
                WHERE id = ?
                "#,
                params![format_datetime(retry_at), error, now_str, id],
            )?;
            FailOutcome::Retrying(retry_at)
        } else {
            tx.execute(
                r#"
                UPDATE enrichment_jobs
                SET status = 'failed', leased_until = NULL, last_error = ?, updated_at = ?
                WHERE id = ?
                "#,
                params![error, now_str, id],
            )?;
            FailOutcome::Failed
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Get a job by ID
    pub fn get_job(&self, id: i64) -> Result<Option<EnrichmentJob>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM enrichment_jobs WHERE id = ?", JOB_COLUMNS),
                params![id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// The queued or running job for a transaction, if any
    pub fn live_job_for(&self, transaction_id: i64) -> Result<Option<EnrichmentJob>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM enrichment_jobs WHERE job_key = ? AND status IN ('queued', 'running')",
                    JOB_COLUMNS
                ),
                params![job_key(transaction_id)],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// List jobs, newest first, optionally filtered by status
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<EnrichmentJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM enrichment_jobs
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY updated_at DESC, id DESC
            LIMIT ?2
            "#,
            JOB_COLUMNS
        ))?;

        let jobs = stmt
            .query_map(params![status.map(|s| s.as_str()), limit], row_to_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Job counts per status
    pub fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, i64)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM enrichment_jobs GROUP BY status ORDER BY status")?;

        let counts = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                Ok((parse_enum::<JobStatus>(0, &status)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

/// Insert a job, or merge it into the live job holding the same key
///
/// Callers run this inside a write transaction.
pub(crate) fn insert_or_merge_job(conn: &Connection, job: &NewJob) -> Result<EnqueueOutcome> {
    let key = job_key(job.transaction_id);
    let payload = serde_json::to_string(&job.payload)?;
    let now = format_datetime(Utc::now());
    let not_before = format_datetime(job.not_before);

    let live: Option<i64> = conn
        .query_row(
            "SELECT id FROM enrichment_jobs WHERE job_key = ? AND status IN ('queued', 'running')",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    let outcome = match live {
        Some(id) => {
            conn.execute(
                r#"
                UPDATE enrichment_jobs
                SET not_before = MIN(not_before, ?1),
                    payload = CASE WHEN status = 'queued' THEN ?2 ELSE payload END,
                    kind = CASE WHEN status = 'queued' AND ?3 = 'enrich' THEN 'enrich' ELSE kind END,
                    updated_at = ?4
                WHERE id = ?5
                "#,
                params![not_before, payload, job.kind.as_str(), now, id],
            )?;
            EnqueueOutcome::Merged(id)
        }
        None => {
            conn.execute(
                r#"
                INSERT INTO enrichment_jobs (job_key, kind, transaction_id, payload, status,
                                             max_attempts, backoff_ms, not_before,
                                             created_at, updated_at)
                VALUES (?, ?, ?, ?, 'queued', ?, ?, ?, ?, ?)
                "#,
                params![
                    key,
                    job.kind.as_str(),
                    job.transaction_id,
                    payload,
                    job.max_attempts,
                    job.backoff_ms as i64,
                    not_before,
                    now,
                    now
                ],
            )?;
            EnqueueOutcome::Enqueued(conn.last_insert_rowid())
        }
    };

    debug!(job_key = %key, kind = job.kind.as_str(), ?outcome, "Enqueued job");
    Ok(outcome)
}

/// `base × 2^(attempts-1)`, so the first retry waits exactly `base`
fn retry_delay(backoff_ms: u64, attempts: u32) -> Duration {
    let shift = attempts.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    let ms = backoff_ms
        .saturating_mul(1u64 << shift)
        .min(MAX_RETRY_DELAY_MS);
    Duration::milliseconds(ms as i64)
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<EnrichmentJob> {
    let kind: String = row.get(2)?;
    let payload: String = row.get(4)?;
    let status: String = row.get(5)?;
    let backoff_ms: i64 = row.get(8)?;
    let not_before: String = row.get(9)?;
    let leased_until: Option<String> = row.get(10)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    Ok(EnrichmentJob {
        id: row.get(0)?,
        job_key: row.get(1)?,
        kind: parse_enum::<JobKind>(2, &kind)?,
        transaction_id: row.get(3)?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        status: parse_enum(5, &status)?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        backoff_ms: backoff_ms.max(0) as u64,
        not_before: parse_datetime(&not_before),
        leased_until: leased_until.as_deref().map(parse_datetime),
        last_error: row.get(11)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}
